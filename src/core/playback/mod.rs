//! Client-side playback: stream transport, chunk buffer, scheduling engine
//! and audio outputs.

pub mod buffer;
pub mod client;
pub mod engine;
pub mod output;

pub use buffer::{AudioBuffer, ClientStreamBuffer};
pub use client::{play_stream, ClientError, StreamClient};
pub use engine::{PlaybackEngine, PlaybackError, PlaybackEvent, PlaybackMode, PlaybackState};
pub use output::{AudioOutput, RodioOutput, VirtualOutput};
