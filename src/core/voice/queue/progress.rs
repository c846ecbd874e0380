//! Per-task chunk log shared between the worker and stream subscribers.
//!
//! The worker appends chunks as segments are synthesized and finishes the log
//! with exactly one outcome. Subscribers replay from index 1, so a listener
//! joining an in-flight task still sees the complete ordered sequence.

use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use tokio::sync::watch;

use crate::core::voice::codec;

/// How a task ended, as seen by stream subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Audio produced. `cached` is false when storing the artifact failed.
    Completed { cached: bool, duration: f64 },
    /// Audio was already in the cache; no chunks were produced.
    Skipped { duration: f64 },
    Failed { message: String },
}

/// One synthesized segment, already encoded for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedChunk {
    /// 1-based, gapless
    pub index: u64,
    /// Base64 of little-endian 16-bit PCM
    pub data: Arc<str>,
    pub sample_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    Chunk(ProducedChunk),
    Finished(TaskOutcome),
}

#[derive(Default)]
struct ProgressState {
    chunks: Vec<ProducedChunk>,
    samples: Vec<i16>,
    outcome: Option<TaskOutcome>,
}

pub struct TaskProgress {
    state: Mutex<ProgressState>,
    version: watch::Sender<u64>,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskProgress {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(ProgressState::default()),
            version,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Append the samples of the next segment. Returns the chunk index, or
    /// `None` once the log is finished.
    pub fn push_chunk(&self, samples: &[i16]) -> Option<u64> {
        let index = {
            let mut state = self.state();
            if state.outcome.is_some() {
                return None;
            }
            let index = state.chunks.len() as u64 + 1;
            state.chunks.push(ProducedChunk {
                index,
                data: codec::encode_chunk(samples).into(),
                sample_count: samples.len(),
            });
            state.samples.extend_from_slice(samples);
            index
        };
        self.bump();
        Some(index)
    }

    /// Record the outcome. Only the first call has any effect.
    pub fn finish(&self, outcome: TaskOutcome) -> bool {
        {
            let mut state = self.state();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
        }
        self.bump();
        true
    }

    pub fn chunk_count(&self) -> usize {
        self.state().chunks.len()
    }

    /// All samples produced so far, in chunk order.
    pub fn samples(&self) -> Vec<i16> {
        self.state().samples.clone()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.state().outcome.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state().outcome.is_some()
    }

    /// Start reading the log from the first chunk.
    pub fn subscribe(self: &Arc<Self>) -> ProgressSubscription {
        ProgressSubscription {
            progress: Arc::clone(self),
            version: self.version.subscribe(),
            cursor: 0,
            done: false,
        }
    }
}

/// A reader over one task's chunk log.
pub struct ProgressSubscription {
    progress: Arc<TaskProgress>,
    version: watch::Receiver<u64>,
    cursor: usize,
    done: bool,
}

impl ProgressSubscription {
    /// Next chunk in order, then the outcome, then `None`.
    pub async fn next(&mut self) -> Option<ProgressUpdate> {
        if self.done {
            return None;
        }
        loop {
            // Mark the current version seen before inspecting state so an
            // update racing with the check still wakes `changed()`.
            self.version.borrow_and_update();
            {
                let state = self.progress.state();
                if let Some(chunk) = state.chunks.get(self.cursor) {
                    self.cursor += 1;
                    return Some(ProgressUpdate::Chunk(chunk.clone()));
                }
                if let Some(outcome) = &state.outcome {
                    self.done = true;
                    return Some(ProgressUpdate::Finished(outcome.clone()));
                }
            }
            if self.version.changed().await.is_err() {
                self.done = true;
                return None;
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressUpdate> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|update| (update, sub))
        })
    }
}
