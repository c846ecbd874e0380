//! Property-based tests for voicecast
//!
//! Property tests verify invariants that should hold for all inputs, rather
//! than testing specific cases.
//!
//! ## Running Property Tests
//!
//! ```sh
//! cargo test property --release
//! ```
//!
//! ## Test Modules
//!
//! - `audio_cache_props`: LRU audio cache
//!   - Total size never exceeds the budget after any sequence of puts
//!   - Evicted entries are always the least recently accessed ones
//!
//! - `playback_props`: client buffer and playback engine
//!   - Materialized duration equals the sum of chunk durations
//!   - Seek lands within 100 ms of the clamped target
//!   - Resume continues within 100 ms of the pause position
//!   - No part of the timeline is rendered twice
//!
//! - `codec_props`: PCM wire and file codecs
//!   - Decoding an encoded chunk reproduces the samples exactly
//!
//! The default of 256 cases per property can be changed with
//! `PROPTEST_CASES`.

mod audio_cache_props;
mod codec_props;
mod playback_props;
