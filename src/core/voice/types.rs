use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Audio Format
// ============================================================================

/// Output sample rate of every artifact and chunk (mono, 16-bit).
pub const SAMPLE_RATE: u32 = 24_000;

/// Channel count of every artifact and chunk.
pub const CHANNELS: u16 = 1;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Queue is full ({0} active tasks)")]
    QueueFull(usize),

    #[error("Queue is shutting down")]
    ShuttingDown,

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Cache error: {0}")]
    Cache(#[from] crate::core::voice::cache::CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GenerationError>;

/// Failure reported by a synthesis provider for one attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider returned empty audio")]
    EmptyOutput,

    #[error("Provider returned malformed audio: {0}")]
    Malformed(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

// ============================================================================
// Task Model
// ============================================================================

/// Generation task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in queue
    Pending,
    /// Provider attempts in progress
    Processing,
    /// Audio produced
    Completed,
    /// Retries exhausted or request rejected
    Failed,
    /// Audio was already cached, nothing generated
    Skipped,
}

impl TaskStatus {
    /// Pending or processing tasks count against capacity and deduplication.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Priority level for tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background pre-generation
    Low,
    #[default]
    Normal,
    /// A listener is waiting on the stream
    High,
}

impl TaskPriority {
    /// Highest first, the order the dispatcher drains queues in.
    pub const DRAIN_ORDER: [TaskPriority; 3] = [Self::High, Self::Normal, Self::Low];
}

/// A validated request, ready to be queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// Canonical text as produced by the preprocessor
    pub text: String,
    pub voice: String,
    pub language: String,
    /// Digest of (text, voice, language)
    pub content_hash: String,
    pub priority: TaskPriority,
    pub pregenerate: bool,
}

/// A unit of generation work owned by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationTask {
    pub task_id: String,
    pub content_hash: String,
    /// Normalized text, kept so interrupted tasks can resume after restart
    pub text: String,
    pub voice: String,
    pub language: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Deadline of the attempt in flight
    pub timeout_at: Option<DateTime<Utc>>,
    /// Content hash of the produced artifact
    pub result_ref: Option<String>,
    /// Last error recorded (kept across retries)
    pub error: Option<String>,
    pub is_pregenerated: bool,
}

impl GenerationTask {
    pub fn new(request: &PreparedRequest) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            content_hash: request.content_hash.clone(),
            text: request.text.clone(),
            voice: request.voice.clone(),
            language: request.language.clone(),
            priority: request.priority,
            status: TaskStatus::Pending,
            attempt_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_at: None,
            result_ref: None,
            error: None,
            is_pregenerated: request.pregenerate,
        }
    }

    /// Short prefix of the text for logs and events.
    pub fn text_preview(&self) -> String {
        let preview: String = self.text.chars().take(48).collect();
        if preview.len() < self.text.len() {
            format!("{preview}…")
        } else {
            preview
        }
    }
}
