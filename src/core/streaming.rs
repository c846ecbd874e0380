//! Audio Stream Protocol
//!
//! Server-sent events carrying cache hits, PCM chunks, completion and
//! errors, plus the client-side pieces that turn a byte stream back into
//! validated events.
//!
//! ```text
//! event: chunk
//! data: {"index": 1, "data": "<base64 PCM>"}
//!
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Types
// ============================================================================

/// One event of an audio stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The whole file is available at `audio_url`; no chunks follow.
    Cached { audio_url: String, duration: f64 },
    /// Next piece of audio, `index` starting at 1.
    Chunk { index: u64, data: String },
    /// Generation finished. `audio_url` is absent when the result could not
    /// be cached.
    Complete {
        audio_url: Option<String>,
        duration: f64,
    },
    Error { message: String },
}

#[derive(Serialize, Deserialize)]
struct CachedPayload {
    audio_url: String,
    duration: f64,
}

#[derive(Serialize, Deserialize)]
struct ChunkPayload {
    index: u64,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct CompletePayload {
    audio_url: Option<String>,
    duration: f64,
}

#[derive(Serialize, Deserialize)]
struct ErrorPayload {
    message: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown event type: {0:?}")]
    UnknownEvent(String),

    #[error("Invalid {event} payload: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Chunk {got} arrived while expecting chunk {expected}")]
    Gap { expected: u64, got: u64 },

    #[error("Chunk received after a cached event")]
    ChunkAfterCached,

    #[error("Complete event without any audio")]
    CompleteWithoutAudio,

    #[error("{0} event after the stream ended")]
    AfterTerminal(&'static str),
}

impl StreamEvent {
    pub const CACHED: &'static str = "cached";
    pub const CHUNK: &'static str = "chunk";
    pub const COMPLETE: &'static str = "complete";
    pub const ERROR: &'static str = "error";

    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cached { .. } => Self::CACHED,
            Self::Chunk { .. } => Self::CHUNK,
            Self::Complete { .. } => Self::COMPLETE,
            Self::Error { .. } => Self::ERROR,
        }
    }

    /// `complete` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// JSON body of the `data:` line
    pub fn data_json(&self) -> String {
        let value = match self {
            Self::Cached {
                audio_url,
                duration,
            } => serde_json::to_string(&CachedPayload {
                audio_url: audio_url.clone(),
                duration: *duration,
            }),
            Self::Chunk { index, data } => serde_json::to_string(&ChunkPayload {
                index: *index,
                data: data.clone(),
            }),
            Self::Complete {
                audio_url,
                duration,
            } => serde_json::to_string(&CompletePayload {
                audio_url: audio_url.clone(),
                duration: *duration,
            }),
            Self::Error { message } => serde_json::to_string(&ErrorPayload {
                message: message.clone(),
            }),
        };
        // Plain structs of strings and numbers always serialize
        value.unwrap_or_else(|_| "{}".to_string())
    }

    /// Full wire frame including the terminating blank line
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data_json())
    }

    pub fn from_frame(frame: &SseFrame) -> Result<Self, ProtocolError> {
        let event = frame.event.as_deref().unwrap_or("message");
        let invalid = |source| ProtocolError::InvalidPayload {
            event: event.to_string(),
            source,
        };

        match event {
            Self::CACHED => {
                let p: CachedPayload = serde_json::from_str(&frame.data).map_err(invalid)?;
                Ok(Self::Cached {
                    audio_url: p.audio_url,
                    duration: p.duration,
                })
            }
            Self::CHUNK => {
                let p: ChunkPayload = serde_json::from_str(&frame.data).map_err(invalid)?;
                Ok(Self::Chunk {
                    index: p.index,
                    data: p.data,
                })
            }
            Self::COMPLETE => {
                let p: CompletePayload = serde_json::from_str(&frame.data).map_err(invalid)?;
                Ok(Self::Complete {
                    audio_url: p.audio_url,
                    duration: p.duration,
                })
            }
            Self::ERROR => {
                let p: ErrorPayload = serde_json::from_str(&frame.data).map_err(invalid)?;
                Ok(Self::Error { message: p.message })
            }
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// Index carried by a chunk frame whose payload is otherwise unreadable.
pub fn chunk_index_hint(frame: &SseFrame) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(&frame.data)
        .ok()?
        .get("index")?
        .as_u64()
}

// ============================================================================
// SSE Parser
// ============================================================================

/// A dispatched SSE frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Input may be split anywhere, including inside a line or a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse incoming bytes and return every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data, id })
    }

    /// Bytes received after the last complete line
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

// ============================================================================
// Sequencer
// ============================================================================

/// Enforces stream ordering on the receiving side: gapless chunk indices
/// from 1, no chunks after `cached`, `complete` only after audio, nothing
/// after a terminal event. Duplicate chunks are dropped.
#[derive(Debug)]
pub struct StreamSequencer {
    next_index: u64,
    cached: bool,
    finished: bool,
}

impl Default for StreamSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSequencer {
    pub fn new() -> Self {
        Self {
            next_index: 1,
            cached: false,
            finished: false,
        }
    }

    /// Returns the event if it should be delivered, `None` for a duplicate.
    pub fn accept(&mut self, event: StreamEvent) -> Result<Option<StreamEvent>, ProtocolError> {
        if self.finished {
            return Err(ProtocolError::AfterTerminal(event.name()));
        }

        match &event {
            StreamEvent::Cached { .. } => {
                if self.next_index > 1 {
                    return Err(ProtocolError::AfterTerminal(StreamEvent::CACHED));
                }
                self.cached = true;
            }
            StreamEvent::Chunk { index, .. } => {
                if self.cached {
                    return Err(ProtocolError::ChunkAfterCached);
                }
                if *index < self.next_index {
                    log::debug!("Dropping duplicate chunk {}", index);
                    return Ok(None);
                }
                if *index > self.next_index {
                    return Err(ProtocolError::Gap {
                        expected: self.next_index,
                        got: *index,
                    });
                }
                self.next_index += 1;
            }
            StreamEvent::Complete { .. } => {
                if self.next_index == 1 && !self.cached {
                    return Err(ProtocolError::CompleteWithoutAudio);
                }
                self.finished = true;
            }
            StreamEvent::Error { .. } => {
                self.finished = true;
            }
        }

        Ok(Some(event))
    }

    /// Account for a chunk whose payload could not be read. When its index
    /// is the one expected next, the following chunk is accepted without a
    /// gap. A missing index is taken to be the expected one.
    pub fn skip_unreadable_chunk(&mut self, index: Option<u64>) {
        if self.finished || self.cached {
            return;
        }
        if index.unwrap_or(self.next_index) == self.next_index {
            self.next_index += 1;
        }
    }

    pub fn chunks_delivered(&self) -> u64 {
        self.next_index - 1
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the stream answered with a cached file.
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}
