//! Audio output runtimes.
//!
//! The engine talks to the host audio device through [`AudioOutput`]: a
//! monotonic output clock plus "play this buffer at that time". Two
//! implementations:
//! - [`RodioOutput`] drives the default device through a rodio `Sink`
//! - [`VirtualOutput`] renders nothing and advances only when told to, for
//!   headless runs and tests

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rodio::buffer::SamplesBuffer;
use rodio::source::{EmptyCallback, Source, Zero};
use rodio::{OutputStream, OutputStreamHandle, Sink};

use super::buffer::AudioBuffer;
use super::engine::PlaybackError;
use crate::core::voice::types::{CHANNELS, SAMPLE_RATE};

/// Identifies one scheduled source on an output.
pub type SourceId = u64;

/// A buffer to start at a given output time.
#[derive(Debug, Clone)]
pub struct ScheduledAudio {
    pub buffer: AudioBuffer,
    /// Output clock time of the first sample
    pub start_at: f64,
    /// Session timeline position of the first sample
    pub content_offset: f64,
}

pub trait AudioOutput {
    /// Monotonic output clock in seconds.
    fn current_time(&self) -> f64;

    /// Queues `audio` to start at `audio.start_at` at the current rate.
    fn schedule(&mut self, audio: ScheduledAudio) -> Result<SourceId, PlaybackError>;

    /// Cancels every scheduled source, including the one playing now.
    fn stop_all(&mut self);

    fn set_rate(&mut self, rate: f32);

    fn set_volume(&mut self, volume: f32);

    /// Sources that finished rendering since the last call.
    fn take_finished(&mut self) -> Vec<SourceId>;

    /// Releases the device.
    fn close(&mut self);
}

// ============================================================================
// Rodio
// ============================================================================

/// Output clock fed by the audio thread: advances by one sample period
/// (scaled by the playback rate) for every sample the device pulls.
#[derive(Debug)]
struct SampleClock {
    /// Output time in thousandths of a sample period
    elapsed_millis: AtomicU64,
    rate_bits: AtomicU32,
}

impl SampleClock {
    const SCALE: f64 = 1000.0;

    fn new() -> Self {
        Self {
            elapsed_millis: AtomicU64::new(0),
            rate_bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    fn set_rate(&self, rate: f32) {
        self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    fn tick(&self) {
        let rate = f64::from(f32::from_bits(self.rate_bits.load(Ordering::Relaxed)));
        let step = (Self::SCALE / rate).round() as u64;
        self.elapsed_millis.fetch_add(step, Ordering::Relaxed);
    }

    fn seconds(&self) -> f64 {
        let periods = self.elapsed_millis.load(Ordering::Relaxed) as f64 / Self::SCALE;
        periods / (f64::from(SAMPLE_RATE) * f64::from(CHANNELS))
    }
}

/// Source wrapper that ticks a [`SampleClock`] for every sample it yields.
struct Clocked<S> {
    inner: S,
    clock: Arc<SampleClock>,
}

impl<S> Clocked<S> {
    fn new(inner: S, clock: &Arc<SampleClock>) -> Self {
        Self {
            inner,
            clock: Arc::clone(clock),
        }
    }
}

impl<S: Source<Item = f32>> Iterator for Clocked<S> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.inner.next()?;
        self.clock.tick();
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S: Source<Item = f32>> Source for Clocked<S> {
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

/// Plays through the default output device.
///
/// rodio's `OutputStream` is `!Send`, so this type stays on the thread that
/// created it.
pub struct RodioOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    clock: Arc<SampleClock>,
    /// Output time at which everything appended to `sink` has played
    queued_until: f64,
    next_id: SourceId,
    finished: Arc<Mutex<Vec<SourceId>>>,
    rate: f32,
    volume: f32,
}

impl RodioOutput {
    pub fn open_default() -> Result<Self, PlaybackError> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| PlaybackError::Output(format!("Failed to open audio output: {e}")))?;

        Ok(Self {
            _stream: stream,
            handle,
            sink: None,
            clock: Arc::new(SampleClock::new()),
            queued_until: 0.0,
            next_id: 1,
            finished: Arc::new(Mutex::new(Vec::new())),
            rate: 1.0,
            volume: 1.0,
        })
    }

    fn take_sink(&mut self) -> Result<Sink, PlaybackError> {
        if let Some(sink) = self.sink.take() {
            return Ok(sink);
        }
        let sink = Sink::try_new(&self.handle)
            .map_err(|e| PlaybackError::Output(format!("Sink error: {e}")))?;
        sink.set_volume(self.volume);
        sink.set_speed(self.rate);
        Ok(sink)
    }
}

impl AudioOutput for RodioOutput {
    /// Time rendered by the device; it stands still while nothing plays.
    fn current_time(&self) -> f64 {
        self.clock.seconds()
    }

    fn schedule(&mut self, audio: ScheduledAudio) -> Result<SourceId, PlaybackError> {
        let sink = self.take_sink()?;
        let rate = f64::from(self.rate);

        let now = self.current_time();
        if self.queued_until < now || sink.empty() {
            self.queued_until = now;
        }

        // The sink plays its queue back to back; pad with silence to honour
        // the requested start time. Silence is sped up like everything else.
        let gap = audio.start_at - self.queued_until;
        if gap > 0.0 {
            sink.append(Clocked::new(
                Zero::<f32>::new(CHANNELS, SAMPLE_RATE)
                    .take_duration(Duration::from_secs_f64(gap * rate)),
                &self.clock,
            ));
            self.queued_until = audio.start_at;
        }

        let id = self.next_id;
        self.next_id += 1;

        sink.append(Clocked::new(
            SamplesBuffer::new(CHANNELS, SAMPLE_RATE, audio.buffer.samples().to_vec()),
            &self.clock,
        ));
        let finished = Arc::clone(&self.finished);
        sink.append(EmptyCallback::<f32>::new(Box::new(move || {
            finished
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id);
        })));
        sink.play();

        self.queued_until += audio.buffer.duration() / rate;
        self.sink = Some(sink);
        Ok(id)
    }

    fn stop_all(&mut self) {
        // A stopped sink is discarded; the next schedule opens a fresh one
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.queued_until = self.current_time();
    }

    fn set_rate(&mut self, rate: f32) {
        self.rate = rate;
        self.clock.set_rate(rate);
        if let Some(sink) = &self.sink {
            sink.set_speed(rate);
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(sink) = &self.sink {
            sink.set_volume(volume);
        }
    }

    fn take_finished(&mut self) -> Vec<SourceId> {
        std::mem::take(&mut *self.finished.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn close(&mut self) {
        self.stop_all();
    }
}

// ============================================================================
// Virtual
// ============================================================================

#[derive(Debug, Clone)]
struct VirtualSource {
    id: SourceId,
    start_at: f64,
    content_offset: f64,
    /// Content length in seconds
    length: f64,
    rate: f64,
}

impl VirtualSource {
    fn end_at(&self) -> f64 {
        self.start_at + self.length / self.rate
    }

    /// Timeline range rendered by output time `now`.
    fn rendered_by(&self, now: f64) -> Option<(f64, f64)> {
        if now <= self.start_at {
            return None;
        }
        let played = ((now - self.start_at) * self.rate).min(self.length);
        Some((self.content_offset, self.content_offset + played))
    }
}

/// Output with a manual clock. Keeps a log of which parts of the session
/// timeline were rendered.
#[derive(Debug)]
pub struct VirtualOutput {
    now: f64,
    next_id: SourceId,
    active: Vec<VirtualSource>,
    finished: Vec<SourceId>,
    rendered: Vec<(f64, f64)>,
    scheduled: usize,
    /// Clock advance per `take_finished` call
    step: f64,
    rate: f32,
    volume: f32,
    closed: bool,
}

impl Default for VirtualOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualOutput {
    pub fn new() -> Self {
        Self {
            now: 0.0,
            next_id: 1,
            active: Vec::new(),
            finished: Vec::new(),
            rendered: Vec::new(),
            scheduled: 0,
            step: 0.0,
            rate: 1.0,
            volume: 1.0,
            closed: false,
        }
    }

    /// Free-running output: the clock moves `step` seconds every time
    /// finished sources are polled.
    pub fn with_step(step: f64) -> Self {
        Self {
            step: step.max(0.0),
            ..Self::new()
        }
    }

    /// Moves the clock forward, completing every source that ends by then.
    pub fn advance(&mut self, secs: f64) {
        self.now += secs.max(0.0);
        let now = self.now;

        let (done, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|source| source.end_at() <= now);
        self.active = active;

        for source in done {
            self.rendered
                .push((source.content_offset, source.content_offset + source.length));
            self.finished.push(source.id);
        }
    }

    /// Timeline ranges rendered so far, sorted by start. Includes the
    /// played part of sources still in progress.
    pub fn rendered_intervals(&self) -> Vec<(f64, f64)> {
        let mut intervals: Vec<(f64, f64)> = self
            .rendered
            .iter()
            .copied()
            .chain(self.active.iter().filter_map(|s| s.rendered_by(self.now)))
            .filter(|(start, end)| end > start)
            .collect();
        intervals.sort_by(|a, b| a.0.total_cmp(&b.0));
        intervals
    }

    /// Number of sources ever scheduled.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.now
    }

    fn schedule(&mut self, audio: ScheduledAudio) -> Result<SourceId, PlaybackError> {
        if self.closed {
            return Err(PlaybackError::Output("Output closed".to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.scheduled += 1;
        self.active.push(VirtualSource {
            id,
            start_at: audio.start_at,
            content_offset: audio.content_offset,
            length: audio.buffer.duration(),
            rate: f64::from(self.rate),
        });
        Ok(id)
    }

    fn stop_all(&mut self) {
        let now = self.now;
        for source in self.active.drain(..) {
            if let Some(range) = source.rendered_by(now) {
                self.rendered.push(range);
            }
        }
    }

    fn set_rate(&mut self, rate: f32) {
        self.rate = rate;
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    fn take_finished(&mut self) -> Vec<SourceId> {
        if self.step > 0.0 {
            self.advance(self.step);
        }
        std::mem::take(&mut self.finished)
    }

    fn close(&mut self) {
        self.stop_all();
        self.closed = true;
    }
}
