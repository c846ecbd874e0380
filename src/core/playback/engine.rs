//! Playback engine
//!
//! Drives one [`PlaybackSession`] at a time against an [`AudioOutput`].
//!
//! A session starts in streaming mode: every arriving chunk is scheduled on
//! its own, back to back, `SCHEDULE_LEAD` ahead of the output clock. The
//! first resume, seek or rate change while playing switches the session to
//! buffered mode, where output restarts from one materialized buffer and
//! later chunks extend that timeline. Buffered mode never switches back, so
//! audio already scheduled from the buffer is never scheduled again chunk by
//! chunk.
//!
//! Position comes only from the scheduled segments and the output clock.

use futures::future::AbortHandle;
use thiserror::Error;
use tokio::sync::mpsc;

use super::buffer::{AudioBuffer, ClientStreamBuffer};
use super::output::{AudioOutput, ScheduledAudio, SourceId};
use crate::core::voice::codec::CodecError;
use crate::core::voice::types::SAMPLE_RATE;

/// Distance between the output clock and the start of a newly scheduled
/// chunk.
pub const SCHEDULE_LEAD: f64 = 0.1;

pub const MIN_PLAYBACK_RATE: f32 = 0.5;
pub const MAX_PLAYBACK_RATE: f32 = 2.0;

/// Half a sample; tolerance when comparing timeline positions.
const POSITION_EPSILON: f64 = 0.5 / SAMPLE_RATE as f64;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("No playback session loaded")]
    NoSession,

    #[error("Cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    #[error("Audio output error: {0}")]
    Output(String),

    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Loaded, waiting for the first audio
    Idle,
    Playing,
    Paused,
    /// Reached the end of a finished stream
    Stopped,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

/// How arriving audio is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    /// Each chunk is scheduled as it arrives
    Streaming,
    /// Output plays the materialized buffer; chunks extend it
    Buffered,
}

/// What makes a session leave streaming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeTrigger {
    Resume,
    Seek,
    RateChange,
    CachedAudio,
}

impl PlaybackMode {
    /// Transition table. No trigger leads back to streaming.
    fn after(self, trigger: ModeTrigger) -> Self {
        match (self, trigger) {
            (Self::Streaming, ModeTrigger::Resume)
            | (Self::Streaming, ModeTrigger::Seek)
            | (Self::Streaming, ModeTrigger::RateChange)
            | (Self::Streaming, ModeTrigger::CachedAudio) => Self::Buffered,
            (Self::Buffered, _) => Self::Buffered,
        }
    }
}

/// Per-session notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// First audio scheduled
    Play { offset: f64 },
    Paused { offset: f64 },
    Resumed { offset: f64 },
    Seeked { offset: f64 },
    ModeChanged(PlaybackMode),
    RateChanged(f32),
    VolumeChanged(f32),
    /// The server finished generating
    StreamComplete {
        duration: f64,
        audio_url: Option<String>,
    },
    /// Transport or output failure; audio already scheduled keeps playing
    Error { message: String },
    /// Everything rendered after the stream finished
    Ended,
    Stopped,
}

/// One buffer handed to the output.
#[derive(Debug, Clone)]
struct Segment {
    source: SourceId,
    start_at: f64,
    content_offset: f64,
    length: f64,
    rate: f64,
}

impl Segment {
    fn content_end(&self) -> f64 {
        self.content_offset + self.length
    }

    fn position_at(&self, now: f64) -> Option<f64> {
        if now < self.start_at {
            return None;
        }
        Some(self.content_offset + ((now - self.start_at) * self.rate).min(self.length))
    }
}

// ============================================================================
// Session
// ============================================================================

/// State of one playback request. Owns the accumulated audio.
#[derive(Debug)]
pub struct PlaybackSession {
    id: u64,
    mode: PlaybackMode,
    state: PlaybackState,
    buffer: ClientStreamBuffer,
    segments: Vec<Segment>,
    /// Timeline position when no segment is rendering
    anchor: f64,
    /// Timeline position up to which audio is scheduled
    scheduled_until: f64,
    /// Output time at which scheduled audio runs out
    schedule_end_at: f64,
    rate: f32,
    volume: f32,
    stream_finished: bool,
    transport: Option<AbortHandle>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackSession {
    fn new(
        id: u64,
        mode: PlaybackMode,
        rate: f32,
        volume: f32,
        transport: Option<AbortHandle>,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            mode,
            state: PlaybackState::Idle,
            buffer: ClientStreamBuffer::new(),
            segments: Vec::new(),
            anchor: 0.0,
            scheduled_until: 0.0,
            schedule_end_at: 0.0,
            rate,
            volume,
            stream_finished: false,
            transport,
            events,
        };
        (session, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Known duration: everything received so far.
    pub fn duration(&self) -> f64 {
        self.buffer.get_duration()
    }

    pub fn chunk_count(&self) -> usize {
        self.buffer.chunk_count()
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_stream_finished(&self) -> bool {
        self.stream_finished
    }

    fn emit(&self, event: PlaybackEvent) {
        // Receiver may be gone; the session keeps working without a listener
        let _ = self.events.send(event);
    }

    fn transition(&mut self, trigger: ModeTrigger) {
        let next = self.mode.after(trigger);
        if next != self.mode {
            log::debug!("Session {} switches to {:?} ({:?})", self.id, next, trigger);
            self.mode = next;
            self.emit(PlaybackEvent::ModeChanged(next));
        }
    }

    fn position_at(&self, now: f64) -> f64 {
        match self.state {
            PlaybackState::Playing => self
                .segments
                .iter()
                .filter_map(|segment| segment.position_at(now))
                .fold(self.anchor, f64::max),
            _ => self.anchor,
        }
    }

    /// Hands `buffer` to the output right after whatever is scheduled.
    fn schedule<O: AudioOutput>(
        &mut self,
        output: &mut O,
        buffer: AudioBuffer,
        content_offset: f64,
    ) -> Result<(), PlaybackError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let start_at = (output.current_time() + SCHEDULE_LEAD).max(self.schedule_end_at);
        let length = buffer.duration();
        let rate = f64::from(self.rate);
        let source = output.schedule(ScheduledAudio {
            buffer,
            start_at,
            content_offset,
        })?;

        self.segments.push(Segment {
            source,
            start_at,
            content_offset,
            length,
            rate,
        });
        self.schedule_end_at = start_at + length / rate;
        self.scheduled_until = content_offset + length;
        Ok(())
    }

    /// Drops everything scheduled and restarts from `offset` using the
    /// materialized buffer.
    fn restart_from<O: AudioOutput>(
        &mut self,
        output: &mut O,
        offset: f64,
    ) -> Result<(), PlaybackError> {
        self.cancel_scheduled(output, offset);
        let tail = self.buffer.tail_from(offset);
        self.schedule(output, tail, offset)
    }

    fn cancel_scheduled<O: AudioOutput>(&mut self, output: &mut O, offset: f64) {
        output.stop_all();
        self.segments.clear();
        self.anchor = offset;
        self.scheduled_until = offset;
        self.schedule_end_at = output.current_time();
    }

    /// Whether all received audio has rendered.
    fn caught_up(&self) -> bool {
        self.segments.is_empty() && self.scheduled_until + POSITION_EPSILON >= self.duration()
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct PlaybackEngine<O: AudioOutput> {
    output: O,
    session: Option<PlaybackSession>,
    next_session_id: u64,
    rate: f32,
    volume: f32,
}

impl<O: AudioOutput> PlaybackEngine<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            session: None,
            next_session_id: 1,
            rate: 1.0,
            volume: 1.0,
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> PlaybackState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(PlaybackState::Idle)
    }

    pub fn mode(&self) -> Option<PlaybackMode> {
        self.session.as_ref().map(|s| s.mode)
    }

    /// Current offset into the session timeline, in seconds.
    pub fn position(&self) -> f64 {
        let now = self.output.current_time();
        self.session
            .as_ref()
            .map(|s| s.position_at(now))
            .unwrap_or(0.0)
    }

    pub fn duration(&self) -> f64 {
        self.session.as_ref().map(|s| s.duration()).unwrap_or(0.0)
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    fn open_session(
        &mut self,
        mode: PlaybackMode,
        transport: Option<AbortHandle>,
    ) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        self.stop();

        let id = self.next_session_id;
        self.next_session_id += 1;
        self.output.set_rate(self.rate);
        self.output.set_volume(self.volume);

        let (session, rx) = PlaybackSession::new(id, mode, self.rate, self.volume, transport);
        self.session = Some(session);
        rx
    }

    /// Starts a streaming session. `transport` is aborted by [`stop`](Self::stop).
    pub fn load_stream(
        &mut self,
        transport: Option<AbortHandle>,
    ) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        let rx = self.open_session(PlaybackMode::Streaming, transport);
        log::debug!("Loaded streaming session {}", self.next_session_id - 1);
        rx
    }

    /// Starts a buffered session over a complete file and begins playing.
    pub fn load_cached(
        &mut self,
        pcm: &[i16],
    ) -> Result<mpsc::UnboundedReceiver<PlaybackEvent>, PlaybackError> {
        let rx = self.open_session(PlaybackMode::Buffered, None);
        let Self {
            output, session, ..
        } = self;
        let Some(session) = session.as_mut() else {
            return Err(PlaybackError::NoSession);
        };

        session.buffer.append_pcm(pcm);
        session.stream_finished = true;
        session.restart_from(output, 0.0)?;
        session.state = PlaybackState::Playing;
        session.emit(PlaybackEvent::Play { offset: 0.0 });
        Ok(rx)
    }

    // ------------------------------------------------------------------------
    // Stream input
    // ------------------------------------------------------------------------

    /// Appends an arriving chunk and schedules it unless paused. Undecodable
    /// chunks are logged and skipped.
    pub fn on_chunk(&mut self, index: u64, data: &str) {
        let Self {
            output, session, ..
        } = self;
        let Some(session) = session.as_mut() else {
            return;
        };
        if session.state == PlaybackState::Stopped {
            return;
        }

        let content_offset = session.duration();
        let chunk = match session.buffer.append_chunk(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Skipping chunk {}: {}", index, e);
                return;
            }
        };

        if session.state == PlaybackState::Paused {
            return;
        }

        let scheduled = match session.mode {
            PlaybackMode::Streaming => session.schedule(output, chunk, content_offset),
            PlaybackMode::Buffered => {
                let from = session.scheduled_until;
                let tail = session.buffer.tail_from(from);
                session.schedule(output, tail, from)
            }
        };
        if let Err(e) = scheduled {
            log::error!("Failed to schedule chunk {}: {}", index, e);
            session.emit(PlaybackEvent::Error {
                message: e.to_string(),
            });
            return;
        }

        if session.state == PlaybackState::Idle {
            session.state = PlaybackState::Playing;
            session.emit(PlaybackEvent::Play {
                offset: content_offset,
            });
        }
    }

    /// The server answered with a complete file instead of chunks.
    pub fn on_cached_audio(&mut self, pcm: &[i16]) {
        let Self {
            output, session, ..
        } = self;
        let Some(session) = session.as_mut() else {
            return;
        };
        if session.buffer.sample_count() > 0 {
            log::warn!("Ignoring cached audio for session {} with chunks", session.id);
            return;
        }

        session.buffer.append_pcm(pcm);
        session.stream_finished = true;
        session.transition(ModeTrigger::CachedAudio);

        if session.state != PlaybackState::Idle {
            return;
        }
        match session.restart_from(output, 0.0) {
            Ok(()) => {
                session.state = PlaybackState::Playing;
                session.emit(PlaybackEvent::Play { offset: 0.0 });
            }
            Err(e) => session.emit(PlaybackEvent::Error {
                message: e.to_string(),
            }),
        }
    }

    pub fn on_stream_complete(&mut self, audio_url: Option<String>) {
        if let Some(session) = self.session.as_mut() {
            session.stream_finished = true;
            session.emit(PlaybackEvent::StreamComplete {
                duration: session.duration(),
                audio_url,
            });
        }
    }

    /// Transport failure or an `error` event. Scheduled audio keeps playing.
    pub fn on_stream_error(&mut self, message: impl Into<String>) {
        if let Some(session) = self.session.as_mut() {
            let message = message.into();
            log::warn!("Stream error in session {}: {}", session.id, message);
            session.stream_finished = true;
            session.emit(PlaybackEvent::Error { message });
        }
    }

    // ------------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------------

    pub fn pause(&mut self) -> Result<(), PlaybackError> {
        let Self {
            output, session, ..
        } = self;
        let session = session.as_mut().ok_or(PlaybackError::NoSession)?;
        if session.state != PlaybackState::Playing {
            return Err(PlaybackError::InvalidState {
                op: "pause",
                state: session.state.as_str(),
            });
        }

        let offset = session.position_at(output.current_time());
        session.cancel_scheduled(output, offset);
        session.state = PlaybackState::Paused;
        session.emit(PlaybackEvent::Paused { offset });
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), PlaybackError> {
        let Self {
            output, session, ..
        } = self;
        let session = session.as_mut().ok_or(PlaybackError::NoSession)?;
        if session.state != PlaybackState::Paused {
            return Err(PlaybackError::InvalidState {
                op: "resume",
                state: session.state.as_str(),
            });
        }

        session.transition(ModeTrigger::Resume);
        let offset = session.anchor;
        session.restart_from(output, offset)?;
        session.state = PlaybackState::Playing;
        session.emit(PlaybackEvent::Resumed { offset });
        Ok(())
    }

    /// Moves to `offset` clamped into the known duration. Returns the
    /// offset actually used.
    pub fn seek(&mut self, offset: f64) -> f64 {
        let Self {
            output, session, ..
        } = self;
        let Some(session) = session.as_mut() else {
            return 0.0;
        };

        let target = if offset.is_finite() {
            offset.clamp(0.0, session.duration())
        } else {
            0.0
        };
        if session.state == PlaybackState::Stopped {
            return target;
        }

        session.transition(ModeTrigger::Seek);
        match session.state {
            PlaybackState::Playing => {
                if let Err(e) = session.restart_from(output, target) {
                    session.emit(PlaybackEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
            _ => {
                session.anchor = target;
                session.scheduled_until = target;
            }
        }
        session.emit(PlaybackEvent::Seeked { offset: target });
        target
    }

    /// Sets the rate, clamped into [0.5, 2.0], keeping the position.
    pub fn set_playback_rate(&mut self, rate: f32) -> f32 {
        let rate = if rate.is_finite() {
            rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE)
        } else {
            1.0
        };
        if (rate - self.rate).abs() < f32::EPSILON {
            return rate;
        }
        self.rate = rate;

        let Self {
            output, session, ..
        } = self;
        let Some(session) = session.as_mut() else {
            output.set_rate(rate);
            return rate;
        };

        if session.state == PlaybackState::Playing {
            let offset = session.position_at(output.current_time());
            output.stop_all();
            output.set_rate(rate);
            session.rate = rate;
            session.transition(ModeTrigger::RateChange);
            if let Err(e) = session.restart_from(output, offset) {
                session.emit(PlaybackEvent::Error {
                    message: e.to_string(),
                });
            }
        } else {
            output.set_rate(rate);
            session.rate = rate;
        }
        session.emit(PlaybackEvent::RateChanged(rate));
        rate
    }

    /// Sets the volume, clamped into [0, 1].
    pub fn set_volume(&mut self, volume: f32) -> f32 {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.volume = volume;
        self.output.set_volume(volume);
        if let Some(session) = self.session.as_mut() {
            session.volume = volume;
            session.emit(PlaybackEvent::VolumeChanged(volume));
        }
        volume
    }

    /// Cancels scheduled audio, aborts the transport and drops the session.
    pub fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        self.output.stop_all();
        if let Some(transport) = session.transport.take() {
            transport.abort();
        }
        session.segments.clear();
        session.buffer.clear();
        session.state = PlaybackState::Stopped;
        session.emit(PlaybackEvent::Stopped);
        log::debug!("Stopped session {}", session.id);
    }

    /// Processes output notifications. Call regularly while a session is
    /// active.
    pub fn pump(&mut self) {
        let finished = self.output.take_finished();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        for id in finished {
            if let Some(i) = session.segments.iter().position(|s| s.source == id) {
                let segment = session.segments.remove(i);
                session.anchor = session.anchor.max(segment.content_end());
            }
        }

        let ended = session.stream_finished
            && match session.state {
                PlaybackState::Playing => session.caught_up(),
                PlaybackState::Idle => true,
                _ => false,
            };
        if ended {
            session.state = PlaybackState::Stopped;
            session.emit(PlaybackEvent::Ended);
            log::debug!("Session {} ended at {:.2}s", session.id, session.anchor);
        }
    }
}

impl<O: AudioOutput> Drop for PlaybackEngine<O> {
    fn drop(&mut self) {
        self.stop();
        self.output.close();
    }
}
