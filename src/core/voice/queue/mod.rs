//! Generation Queue Module
//!
//! Bounded, priority-ordered queue of generation tasks with per-hash
//! deduplication and a durable registry.
//!
//! ```text
//! enqueue ──► pending[High|Normal|Low] ──► worker ──► completed
//!                                             │  ▲        failed
//!                                             ▼  │        skipped
//!                                            backoff
//! ```

pub mod events;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod worker;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;

pub use events::{LogEmitter, NoopEmitter, QueueEventEmitter, QueueStats};
pub use progress::{ProgressSubscription, ProgressUpdate, TaskOutcome, TaskProgress};
pub use registry::TaskRegistry;
pub use retry::{Clock, RetryPolicy, SystemClock};
pub use worker::GenerationWorker;

use events::{
    channels, emit_event, TaskRetryingEvent, TaskStatusEvent, TaskSubmittedEvent,
};

use super::types::{GenerationError, GenerationTask, PreparedRequest, Result, TaskPriority, TaskStatus};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of pending + processing tasks
    pub capacity: usize,
    /// Maximum concurrent provider calls
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    /// Timeout applied to each attempt
    pub attempt_timeout: Duration,
    /// Registry file; `None` keeps tasks in memory only
    pub registry_path: Option<PathBuf>,
    /// Terminal tasks kept in the registry
    pub registry_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_concurrent: 2,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(600),
            registry_path: None,
            registry_retention: 1000,
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub task_id: String,
    pub status: TaskStatus,
    /// True when an in-flight task for the same content was returned
    pub joined: bool,
}

// ============================================================================
// Queue State
// ============================================================================

struct QueueState {
    tasks: HashMap<String, GenerationTask>,
    queues: HashMap<TaskPriority, VecDeque<String>>,
    /// content_hash -> task_id of the pending/processing task
    active_by_hash: HashMap<String, String>,
    /// content_hash -> task_id of the newest task, terminal ones included
    latest_by_hash: HashMap<String, String>,
    progress: HashMap<String, Arc<TaskProgress>>,
    accepting: bool,
}

impl QueueState {
    fn new() -> Self {
        let queues = TaskPriority::DRAIN_ORDER
            .into_iter()
            .map(|p| (p, VecDeque::new()))
            .collect();
        Self {
            tasks: HashMap::new(),
            queues,
            active_by_hash: HashMap::new(),
            latest_by_hash: HashMap::new(),
            progress: HashMap::new(),
            accepting: true,
        }
    }

    fn push_pending(&mut self, task: GenerationTask) -> Arc<TaskProgress> {
        let progress = Arc::new(TaskProgress::new());
        self.active_by_hash
            .insert(task.content_hash.clone(), task.task_id.clone());
        self.progress.insert(task.task_id.clone(), progress.clone());
        self.queues
            .entry(task.priority)
            .or_default()
            .push_back(task.task_id.clone());
        self.insert(task);
        progress
    }

    /// Store a task and remember it as the newest for its hash if it is.
    fn insert(&mut self, task: GenerationTask) {
        let newer = match self
            .latest_by_hash
            .get(&task.content_hash)
            .and_then(|id| self.tasks.get(id))
        {
            Some(current) => task.created_at >= current.created_at,
            None => true,
        };
        if newer {
            self.latest_by_hash
                .insert(task.content_hash.clone(), task.task_id.clone());
        }
        self.tasks.insert(task.task_id.clone(), task);
    }

    /// Move a task to a terminal status and release its hash.
    fn finish(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        update: impl FnOnce(&mut GenerationTask),
    ) -> Option<GenerationTask> {
        let task = self.tasks.get_mut(task_id)?;
        if task.status.is_terminal() {
            return None;
        }
        task.status = status;
        task.completed_at = Some(Utc::now());
        task.timeout_at = None;
        update(task);
        let task = task.clone();

        if self.active_by_hash.get(&task.content_hash).map(String::as_str) == Some(task_id) {
            self.active_by_hash.remove(&task.content_hash);
        }
        self.progress.remove(task_id);
        Some(task)
    }

    fn stats(&self, capacity: usize) -> QueueStats {
        let mut stats = QueueStats {
            capacity,
            ..Default::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }
}

// ============================================================================
// Generation Queue
// ============================================================================

pub struct GenerationQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    registry: TaskRegistry,
    work_available: Notify,
    emitter: Arc<dyn QueueEventEmitter>,
}

impl GenerationQueue {
    pub fn new(config: QueueConfig, emitter: Arc<dyn QueueEventEmitter>) -> Self {
        let registry = TaskRegistry::new(config.registry_path.clone(), config.registry_retention);
        Self {
            config,
            state: Mutex::new(QueueState::new()),
            registry,
            work_available: Notify::new(),
            emitter,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn emitter(&self) -> &dyn QueueEventEmitter {
        self.emitter.as_ref()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore tasks from the registry. Tasks that were processing when the
    /// process stopped go back to pending. Returns the number of pending tasks.
    pub async fn load(&self) -> Result<usize> {
        let tasks = self.registry.load().await?;
        let pending = {
            let mut state = self.state();
            let mut pending = 0;
            for mut task in tasks {
                if task.status == TaskStatus::Processing {
                    log::info!("Re-queueing interrupted task {}", task.task_id);
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                    task.timeout_at = None;
                }

                if task.status == TaskStatus::Pending {
                    if let Some(existing) = state.active_by_hash.get(&task.content_hash) {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(Utc::now());
                        task.error = Some(format!("superseded by task {existing}"));
                        state.insert(task);
                        continue;
                    }
                    pending += 1;
                    state.push_pending(task);
                } else {
                    state.insert(task);
                }
            }
            let pruned = self.registry.prune(&mut state.tasks);
            if pruned > 0 {
                log::debug!("Pruned {} old tasks from the registry", pruned);
            }
            pending
        };

        self.persist().await;
        if pending > 0 {
            log::info!("Restored {} pending generation tasks", pending);
            self.work_available.notify_one();
        }
        Ok(pending)
    }

    /// Submit a request. Joins the in-flight task for the same content when
    /// there is one; fails fast when the queue is at capacity.
    pub async fn enqueue(&self, request: &PreparedRequest) -> Result<Submission> {
        let (submission, event) = {
            let mut state = self.state();
            if !state.accepting {
                return Err(GenerationError::ShuttingDown);
            }

            if let Some(task_id) = state.active_by_hash.get(&request.content_hash) {
                let status = state
                    .tasks
                    .get(task_id)
                    .map(|t| t.status)
                    .unwrap_or(TaskStatus::Pending);
                log::debug!("Joining in-flight task {} for {}", task_id, request.content_hash);
                return Ok(Submission {
                    task_id: task_id.clone(),
                    status,
                    joined: true,
                });
            }

            let active = state.active_by_hash.len();
            if active >= self.config.capacity {
                log::warn!("Rejecting request, queue full ({} active)", active);
                return Err(GenerationError::QueueFull(active));
            }

            let task = GenerationTask::new(request);
            let event = TaskSubmittedEvent::from_task(&task);
            let submission = Submission {
                task_id: task.task_id.clone(),
                status: TaskStatus::Pending,
                joined: false,
            };
            state.push_pending(task);
            (submission, event)
        };

        log::info!(
            "Queued generation task {} ({:?}, {} chars)",
            submission.task_id,
            request.priority,
            event.char_count
        );
        emit_event(self.emitter(), channels::TASK_SUBMITTED, &event);
        self.persist().await;
        self.work_available.notify_one();
        Ok(submission)
    }

    /// Record a pregeneration request whose audio is already cached.
    pub async fn record_skipped(&self, request: &PreparedRequest) -> Result<Submission> {
        let task = {
            let mut state = self.state();
            if !state.accepting {
                return Err(GenerationError::ShuttingDown);
            }
            let mut task = GenerationTask::new(request);
            let now = Utc::now();
            task.status = TaskStatus::Skipped;
            task.completed_at = Some(now);
            task.result_ref = Some(request.content_hash.clone());
            state.insert(task.clone());
            self.registry.prune(&mut state.tasks);
            task
        };

        emit_event(self.emitter(), channels::TASK_SKIPPED, &TaskStatusEvent::from_task(&task));
        self.persist().await;
        Ok(Submission {
            task_id: task.task_id,
            status: TaskStatus::Skipped,
            joined: false,
        })
    }

    /// Take the next pending task (highest priority, FIFO within a priority)
    /// and mark it processing.
    pub async fn next_task(&self) -> Option<(GenerationTask, Arc<TaskProgress>)> {
        let next = {
            let mut state = self.state();
            if !state.accepting {
                return None;
            }
            let mut found = None;
            for priority in TaskPriority::DRAIN_ORDER {
                let Some(task_id) = state.queues.get_mut(&priority).and_then(VecDeque::pop_front)
                else {
                    continue;
                };
                let Some(progress) = state.progress.get(&task_id).cloned() else {
                    continue;
                };
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Processing;
                    task.started_at = Some(Utc::now());
                    found = Some((task.clone(), progress));
                    break;
                }
            }
            found
        }?;

        emit_event(
            self.emitter(),
            channels::TASK_STARTED,
            &TaskStatusEvent::from_task(&next.0),
        );
        self.persist().await;
        Some(next)
    }

    /// Count a new attempt and set its deadline. Returns the attempt number.
    pub async fn begin_attempt(&self, task_id: &str) -> Option<u32> {
        let attempt = {
            let mut state = self.state();
            let task = state.tasks.get_mut(task_id)?;
            task.attempt_count += 1;
            task.timeout_at = chrono::Duration::from_std(self.config.attempt_timeout)
                .ok()
                .and_then(|timeout| Utc::now().checked_add_signed(timeout));
            task.attempt_count
        };
        self.persist().await;
        Some(attempt)
    }

    /// Record a failed attempt that will be retried after `delay`.
    pub async fn record_retry(&self, task_id: &str, error: &str, delay: Duration) {
        let event = {
            let mut state = self.state();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return;
            };
            task.error = Some(error.to_string());
            task.timeout_at = None;
            TaskRetryingEvent {
                task_id: task_id.to_string(),
                failed_attempt: task.attempt_count,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            }
        };
        emit_event(self.emitter(), channels::TASK_RETRYING, &event);
        self.persist().await;
    }

    pub async fn complete(&self, task_id: &str, result_ref: Option<String>) {
        let task = self.state().finish(task_id, TaskStatus::Completed, |task| {
            task.result_ref = result_ref;
            task.error = None;
        });
        self.after_finish(task, channels::TASK_COMPLETED).await;
    }

    pub async fn fail(&self, task_id: &str, error: &str) {
        let task = self.state().finish(task_id, TaskStatus::Failed, |task| {
            task.error = Some(error.to_string());
        });
        self.after_finish(task, channels::TASK_FAILED).await;
    }

    pub async fn skip(&self, task_id: &str) {
        let task = self.state().finish(task_id, TaskStatus::Skipped, |task| {
            task.result_ref = Some(task.content_hash.clone());
        });
        self.after_finish(task, channels::TASK_SKIPPED).await;
    }

    async fn after_finish(&self, task: Option<GenerationTask>, channel: &str) {
        let Some(task) = task else {
            return;
        };
        {
            let mut state = self.state();
            self.registry.prune(&mut state.tasks);
        }
        emit_event(self.emitter(), channel, &TaskStatusEvent::from_task(&task));
        emit_event(self.emitter(), channels::QUEUE_STATS, &self.stats());
        self.persist().await;
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get(&self, task_id: &str) -> Option<GenerationTask> {
        self.state().tasks.get(task_id).cloned()
    }

    /// The pending/processing task for a content hash, with its chunk log.
    pub fn find_active(&self, content_hash: &str) -> Option<(GenerationTask, Arc<TaskProgress>)> {
        let state = self.state();
        let task_id = state.active_by_hash.get(content_hash)?;
        let task = state.tasks.get(task_id)?.clone();
        let progress = state.progress.get(task_id)?.clone();
        Some((task, progress))
    }

    /// The most recently created task for a content hash, whatever its status.
    pub fn latest_for_hash(&self, content_hash: &str) -> Option<GenerationTask> {
        let state = self.state();
        let task_id = state.latest_by_hash.get(content_hash)?;
        state.tasks.get(task_id).cloned()
    }

    pub fn progress(&self, task_id: &str) -> Option<Arc<TaskProgress>> {
        self.state().progress.get(task_id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        self.state().stats(self.config.capacity)
    }

    /// Number of pending + processing tasks
    pub fn len(&self) -> usize {
        self.state().active_by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_accepting(&self) -> bool {
        self.state().accepting
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Wait until new work may be available.
    pub async fn work_available(&self) {
        self.work_available.notified().await;
    }

    /// Stop accepting and dispatching tasks. Listeners of tasks that have not
    /// started are told generation was interrupted; the tasks stay pending
    /// in the registry.
    pub async fn close(&self) {
        let waiting: Vec<Arc<TaskProgress>> = {
            let mut state = self.state();
            state.accepting = false;
            let queued: Vec<String> = state.queues.values().flatten().cloned().collect();
            queued
                .iter()
                .filter_map(|id| state.progress.get(id).cloned())
                .collect()
        };
        for progress in waiting {
            progress.finish(TaskOutcome::Failed {
                message: "generation interrupted by shutdown".to_string(),
            });
        }
        self.work_available.notify_waiters();
        self.persist().await;
    }

    async fn persist(&self) {
        let _guard = self.registry.lock_for_write().await;
        let snapshot = self.state().tasks.clone();
        if let Err(e) = self.registry.save(&snapshot).await {
            log::error!("Failed to persist task registry: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::voice::preprocess::{prepare_request, DefaultPreprocessor};
    use events::testing::RecordingEmitter;
    use tempfile::TempDir;

    fn request(text: &str) -> PreparedRequest {
        prepare_request(&DefaultPreprocessor, text, "A", "en", 1000).unwrap()
    }

    fn queue_with(config: QueueConfig) -> (GenerationQueue, Arc<RecordingEmitter>) {
        let emitter = Arc::new(RecordingEmitter::default());
        (GenerationQueue::new(config, emitter.clone()), emitter)
    }

    #[tokio::test]
    async fn test_enqueue_and_dedup() {
        let (queue, emitter) = queue_with(QueueConfig::default());

        let first = queue.enqueue(&request("hello")).await.unwrap();
        assert!(!first.joined);

        let second = queue.enqueue(&request("hello")).await.unwrap();
        assert!(second.joined);
        assert_eq!(first.task_id, second.task_id);
        assert_eq!(queue.len(), 1);
        assert_eq!(emitter.count(channels::TASK_SUBMITTED), 1);
    }

    #[tokio::test]
    async fn test_dedup_while_processing() {
        let (queue, _) = queue_with(QueueConfig::default());
        let first = queue.enqueue(&request("hello")).await.unwrap();

        let (task, _) = queue.next_task().await.unwrap();
        assert_eq!(task.status, TaskStatus::Processing);

        let again = queue.enqueue(&request("hello")).await.unwrap();
        assert_eq!(again.task_id, first.task_id);
        assert_eq!(again.status, TaskStatus::Processing);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_creates_one_task() {
        let (queue, _) = queue_with(QueueConfig::default());
        let queue = Arc::new(queue);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.enqueue(&request("same text")).await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().task_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let (queue, _) = queue_with(QueueConfig {
            capacity: 2,
            ..Default::default()
        });
        queue.enqueue(&request("one")).await.unwrap();
        queue.enqueue(&request("two")).await.unwrap();

        let result = queue.enqueue(&request("three")).await;
        assert!(matches!(result, Err(GenerationError::QueueFull(2))));

        // Joining an existing task does not need capacity
        assert!(queue.enqueue(&request("one")).await.unwrap().joined);
    }

    #[tokio::test]
    async fn test_priority_order_and_fifo() {
        let (queue, _) = queue_with(QueueConfig::default());
        let mut low = request("low");
        low.priority = TaskPriority::Low;
        let mut high = request("high");
        high.priority = TaskPriority::High;

        let low_id = queue.enqueue(&low).await.unwrap().task_id;
        let normal_a = queue.enqueue(&request("normal a")).await.unwrap().task_id;
        let normal_b = queue.enqueue(&request("normal b")).await.unwrap().task_id;
        let high_id = queue.enqueue(&high).await.unwrap().task_id;

        let mut order = Vec::new();
        while let Some((task, _)) = queue.next_task().await {
            order.push(task.task_id);
        }
        assert_eq!(order, vec![high_id, normal_a, normal_b, low_id]);
    }

    #[tokio::test]
    async fn test_failed_task_is_not_resurrected() {
        let (queue, _) = queue_with(QueueConfig::default());
        let first = queue.enqueue(&request("flaky")).await.unwrap();
        queue.next_task().await.unwrap();
        queue.fail(&first.task_id, "boom").await;

        let task = queue.get(&first.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(queue.next_task().await.is_none());

        // Explicit re-enqueue creates a fresh task
        let second = queue.enqueue(&request("flaky")).await.unwrap();
        assert_ne!(second.task_id, first.task_id);
        assert!(!second.joined);
    }

    #[tokio::test]
    async fn test_record_skipped() {
        let (queue, emitter) = queue_with(QueueConfig::default());
        let submission = queue.record_skipped(&request("cached")).await.unwrap();
        assert_eq!(submission.status, TaskStatus::Skipped);
        assert_eq!(queue.len(), 0);
        assert_eq!(emitter.count(channels::TASK_SKIPPED), 1);
    }

    #[tokio::test]
    async fn test_registry_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            registry_path: Some(dir.path().join("tasks.json")),
            ..Default::default()
        };

        let (done_id, interrupted_id, waiting_id) = {
            let (queue, _) = queue_with(config.clone());
            let done = queue.enqueue(&request("done")).await.unwrap().task_id;
            let interrupted = queue.enqueue(&request("interrupted")).await.unwrap().task_id;
            let waiting = queue.enqueue(&request("waiting")).await.unwrap().task_id;

            queue.next_task().await.unwrap();
            queue.begin_attempt(&done).await;
            queue.complete(&done, Some("hash".into())).await;
            queue.next_task().await.unwrap();
            queue.begin_attempt(&interrupted).await;
            (done, interrupted, waiting)
        };

        let (queue, _) = queue_with(config);
        assert_eq!(queue.load().await.unwrap(), 2);

        let done = queue.get(&done_id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempt_count, 1);

        let interrupted = queue.get(&interrupted_id).unwrap();
        assert_eq!(interrupted.status, TaskStatus::Pending);
        assert_eq!(interrupted.attempt_count, 1);

        let (next, _) = queue.next_task().await.unwrap();
        assert_eq!(next.task_id, interrupted_id);
        let (next, _) = queue.next_task().await.unwrap();
        assert_eq!(next.task_id, waiting_id);
    }

    #[tokio::test]
    async fn test_close_rejects_and_interrupts_waiting_listeners() {
        let (queue, _) = queue_with(QueueConfig::default());
        let submission = queue.enqueue(&request("never started")).await.unwrap();
        let progress = queue.progress(&submission.task_id).unwrap();

        queue.close().await;

        assert!(matches!(
            queue.enqueue(&request("late")).await,
            Err(GenerationError::ShuttingDown)
        ));
        assert!(matches!(progress.outcome(), Some(TaskOutcome::Failed { .. })));
        assert_eq!(queue.get(&submission.task_id).unwrap().status, TaskStatus::Pending);
        assert!(queue.next_task().await.is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let (queue, _) = queue_with(QueueConfig::default());
        let a = queue.enqueue(&request("a")).await.unwrap();
        queue.enqueue(&request("b")).await.unwrap();
        queue.next_task().await.unwrap();
        queue.complete(&a.task_id, None).await;

        let stats = queue.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.capacity, 100);
    }
}
