//! Property-based tests for the client buffer and playback engine
//!
//! Tests invariants:
//! - Materialized audio is the exact concatenation of the chunks
//! - Seek and resume land within 100 ms of their target
//! - No part of the timeline is rendered twice

use proptest::prelude::*;

use crate::core::playback::buffer::ClientStreamBuffer;
use crate::core::playback::engine::{PlaybackEngine, PlaybackMode, PlaybackState};
use crate::core::playback::output::VirtualOutput;
use crate::core::voice::codec::{encode_chunk, normalize_samples};
use crate::core::voice::types::SAMPLE_RATE;

const ONE_SAMPLE: f64 = 1.0 / SAMPLE_RATE as f64;
const TOLERANCE: f64 = 0.1;

// ============================================================================
// Strategies
// ============================================================================

/// Chunk payloads of 5 ms to 1.5 s
fn arb_chunks() -> impl Strategy<Value = Vec<Vec<i16>>> {
    prop::collection::vec(
        (120usize..36_000).prop_map(|len| vec![500i16; len]),
        1..6,
    )
}

fn duration_of(chunks: &[Vec<i16>]) -> f64 {
    chunks.iter().map(|c| c.len() as f64 / SAMPLE_RATE as f64).sum()
}

fn streaming_engine(chunks: &[Vec<i16>]) -> PlaybackEngine<VirtualOutput> {
    let mut engine = PlaybackEngine::new(VirtualOutput::new());
    // events are not inspected here
    drop(engine.load_stream(None));
    for (i, chunk) in chunks.iter().enumerate() {
        engine.on_chunk(i as u64 + 1, &encode_chunk(chunk));
    }
    engine
}

fn advance(engine: &mut PlaybackEngine<VirtualOutput>, secs: f64) {
    engine.output_mut().advance(secs);
    engine.pump();
}

fn overlaps(intervals: &[(f64, f64)]) -> bool {
    intervals.windows(2).any(|pair| pair[1].0 + 1e-9 < pair[0].1)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: materialize() holds every chunk in order and its duration
    /// is the sum of chunk durations within one sample
    #[test]
    fn prop_materialize_matches_chunks(
        chunks in prop::collection::vec(prop::collection::vec(any::<i16>(), 1..2_000), 1..12)
    ) {
        let mut buffer = ClientStreamBuffer::new();
        for chunk in &chunks {
            buffer.append_chunk(&encode_chunk(chunk)).unwrap();
        }

        let materialized = buffer.materialize();
        prop_assert!((materialized.duration() - duration_of(&chunks)).abs() <= ONE_SAMPLE);
        prop_assert!((buffer.get_duration() - duration_of(&chunks)).abs() <= ONE_SAMPLE);

        let expected: Vec<f32> = chunks.iter().flat_map(|c| normalize_samples(c)).collect();
        prop_assert_eq!(materialized.samples(), expected.as_slice());
    }

    /// Property: seek(t) for t in [0, duration] puts the position within
    /// 100 ms of t
    #[test]
    fn prop_seek_lands_near_target(
        chunks in arb_chunks(),
        played in 0.0f64..2.0,
        fraction in 0.0f64..=1.0,
    ) {
        let mut engine = streaming_engine(&chunks);
        advance(&mut engine, played);

        let target = fraction * engine.duration();
        let landed = engine.seek(target);

        prop_assert!((landed - target).abs() <= ONE_SAMPLE);
        prop_assert!((engine.position() - target).abs() <= TOLERANCE);
        prop_assert_eq!(engine.mode(), Some(PlaybackMode::Buffered));

        advance(&mut engine, 0.05);
        prop_assert!((engine.position() - target).abs() <= TOLERANCE);
    }

    /// Property: seeking outside the known duration clamps instead of failing
    #[test]
    fn prop_seek_clamps(chunks in arb_chunks(), target in -100.0f64..100.0) {
        let mut engine = streaming_engine(&chunks);
        let duration = engine.duration();

        let landed = engine.seek(target);
        prop_assert!((0.0..=duration).contains(&landed));
    }

    /// Property: resume continues within 100 ms of where pause stopped, and
    /// every part of the timeline renders exactly once
    #[test]
    fn prop_pause_resume_renders_once(
        chunks in arb_chunks(),
        late in arb_chunks(),
        pause_at in 0.0f64..4.0,
    ) {
        let mut engine = streaming_engine(&chunks);
        advance(&mut engine, pause_at);
        prop_assert_eq!(engine.state(), PlaybackState::Playing);

        engine.pause().unwrap();
        let paused_at = engine.position();

        // chunks that arrive while paused are buffered only
        let scheduled_before = engine.output().scheduled_count();
        let first_late = chunks.len() as u64 + 1;
        for (i, chunk) in late.iter().enumerate() {
            engine.on_chunk(first_late + i as u64, &encode_chunk(chunk));
        }
        prop_assert_eq!(engine.output().scheduled_count(), scheduled_before);

        engine.resume().unwrap();
        prop_assert!((engine.position() - paused_at).abs() <= TOLERANCE);
        prop_assert_eq!(engine.mode(), Some(PlaybackMode::Buffered));

        engine.on_stream_complete(None);
        advance(&mut engine, 30.0);
        prop_assert_eq!(engine.state(), PlaybackState::Stopped);

        let intervals = engine.output().rendered_intervals();
        prop_assert!(!overlaps(&intervals), "rendered twice: {:?}", intervals);
        let rendered: f64 = intervals.iter().map(|(a, b)| b - a).sum();
        let total = duration_of(&chunks) + duration_of(&late);
        prop_assert!((rendered - total).abs() <= TOLERANCE, "rendered {} of {}", rendered, total);
    }
}
