//! Events for the generation queue.

use serde::Serialize;

use crate::core::voice::types::{GenerationTask, TaskPriority, TaskStatus};

// ============================================================================
// Queue Event Emitter Trait
// ============================================================================

/// Sink for queue events.
///
/// Implementations can forward events to a UI, log them, or ignore them.
pub trait QueueEventEmitter: Send + Sync {
    fn emit_json(&self, channel: &str, payload: serde_json::Value);
}

/// Helper to emit typed events through the trait
pub fn emit_event(emitter: &dyn QueueEventEmitter, channel: &str, payload: &impl Serialize) {
    match serde_json::to_value(payload) {
        Ok(value) => emitter.emit_json(channel, value),
        Err(e) => log::warn!("Failed to serialize {} event: {}", channel, e),
    }
}

/// A no-op emitter that discards all events (useful for tests)
pub struct NoopEmitter;

impl QueueEventEmitter for NoopEmitter {
    fn emit_json(&self, _channel: &str, _payload: serde_json::Value) {}
}

/// Default emitter: writes every event to the log at debug level, failures
/// at warn.
pub struct LogEmitter;

impl QueueEventEmitter for LogEmitter {
    fn emit_json(&self, channel: &str, payload: serde_json::Value) {
        if channel == channels::TASK_FAILED {
            log::warn!("{} {}", channel, payload);
        } else {
            log::debug!("{} {}", channel, payload);
        }
    }
}

// ============================================================================
// Queue Events
// ============================================================================

/// Event emitted when a task is submitted
#[derive(Debug, Clone, Serialize)]
pub struct TaskSubmittedEvent {
    pub task_id: String,
    pub content_hash: String,
    pub priority: TaskPriority,
    pub text_preview: String,
    pub char_count: usize,
}

impl TaskSubmittedEvent {
    pub fn from_task(task: &GenerationTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            content_hash: task.content_hash.clone(),
            priority: task.priority,
            text_preview: task.text_preview(),
            char_count: task.text.chars().count(),
        }
    }
}

/// Event emitted when task status changes
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusEvent {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub result_ref: Option<String>,
    pub error: Option<String>,
}

impl TaskStatusEvent {
    pub fn from_task(task: &GenerationTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            attempt_count: task.attempt_count,
            result_ref: task.result_ref.clone(),
            error: task.error.clone(),
        }
    }
}

/// Event emitted after each synthesized segment
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgressEvent {
    pub task_id: String,
    pub chunk_index: u64,
    pub segment_count: usize,
}

/// Event emitted before a backoff sleep
#[derive(Debug, Clone, Serialize)]
pub struct TaskRetryingEvent {
    pub task_id: String,
    pub failed_attempt: u32,
    pub delay_ms: u64,
    pub error: String,
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub capacity: usize,
}

/// Event channel names
pub mod channels {
    pub const TASK_SUBMITTED: &str = "generation:task-submitted";
    pub const TASK_STARTED: &str = "generation:task-started";
    pub const TASK_PROGRESS: &str = "generation:task-progress";
    pub const TASK_RETRYING: &str = "generation:task-retrying";
    pub const TASK_COMPLETED: &str = "generation:task-completed";
    pub const TASK_FAILED: &str = "generation:task-failed";
    pub const TASK_SKIPPED: &str = "generation:task-skipped";
    pub const QUEUE_STATS: &str = "generation:queue-stats";
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Emitter that keeps every event for assertions.
    #[derive(Default)]
    pub struct RecordingEmitter {
        events: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl RecordingEmitter {
        pub fn channels(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
        }

        pub fn count(&self, channel: &str) -> usize {
            self.events.lock().unwrap().iter().filter(|(c, _)| c == channel).count()
        }
    }

    impl QueueEventEmitter for RecordingEmitter {
        fn emit_json(&self, channel: &str, payload: serde_json::Value) {
            self.events.lock().unwrap().push((channel.to_string(), payload));
        }
    }
}
