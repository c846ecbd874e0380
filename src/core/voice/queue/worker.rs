//! Background worker for processing the generation queue.

use std::sync::Arc;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::events::{channels, emit_event, TaskProgressEvent};
use super::progress::{TaskOutcome, TaskProgress};
use super::retry::Clock;
use super::GenerationQueue;
use crate::core::voice::cache::{AudioCache, EntryMetadata};
use crate::core::voice::codec;
use crate::core::voice::preprocess::TextSegmenter;
use crate::core::voice::providers::{SegmentRequest, SynthesisProvider};
use crate::core::voice::types::{GenerationTask, ProviderError};

// ============================================================================
// Background Worker
// ============================================================================

/// Dispatches queued tasks onto a bounded pool of provider calls.
#[derive(Clone)]
pub struct GenerationWorker {
    queue: Arc<GenerationQueue>,
    provider: Arc<dyn SynthesisProvider>,
    cache: Arc<AudioCache>,
    segmenter: TextSegmenter,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
}

impl GenerationWorker {
    pub fn new(
        queue: Arc<GenerationQueue>,
        provider: Arc<dyn SynthesisProvider>,
        cache: Arc<AudioCache>,
        segmenter: TextSegmenter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(queue.config().max_concurrent.max(1)));
        Self {
            queue,
            provider,
            cache,
            segmenter,
            clock,
            permits,
        }
    }

    /// Run the dispatcher until shutdown is signalled, then wait for tasks
    /// already in flight.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut in_flight = JoinSet::new();
        log::info!(
            "Generation worker started ({} concurrent, provider {})",
            self.queue.config().max_concurrent,
            self.provider.id()
        );

        'dispatch: loop {
            let permit = tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => break 'dispatch,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'dispatch,
                },
            };

            let (task, progress) = loop {
                if let Some(next) = self.queue.next_task().await {
                    break next;
                }
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => break 'dispatch,
                    _ = self.queue.work_available() => {}
                    Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                        log_join_result(result);
                    }
                }
            };

            let worker = self.clone();
            let span = tracing::info_span!("generation", task_id = %task.task_id);
            in_flight.spawn(worker.process(task, progress, permit).instrument(span));

            while let Some(result) = in_flight.try_join_next() {
                log_join_result(result);
            }
        }

        log::info!("Generation worker draining {} in-flight tasks", in_flight.len());
        while let Some(result) = in_flight.join_next().await {
            log_join_result(result);
        }
        if let Err(e) = self.cache.flush().await {
            log::warn!("Failed to flush cache metadata: {}", e);
        }
        log::info!("Generation worker stopped");
    }

    /// Generate one task to a terminal state. The permit is held only while
    /// an attempt runs.
    pub async fn process(
        self,
        task: GenerationTask,
        progress: Arc<TaskProgress>,
        permit: OwnedSemaphorePermit,
    ) {
        let task_id = task.task_id.clone();

        if let Some(entry) = self.cache.peek(&task.content_hash).await {
            drop(permit);
            log::info!("Audio for task {} already cached, skipping", task_id);
            self.queue.skip(&task_id).await;
            progress.finish(TaskOutcome::Skipped {
                duration: entry.duration_seconds,
            });
            return;
        }

        let segments = self.segmenter.split(&task.text);
        let policy = self.queue.config().retry.clone();
        let attempt_timeout = self.queue.config().attempt_timeout;
        let mut permit = Some(permit);

        loop {
            let attempt = self.queue.begin_attempt(&task_id).await.unwrap_or(1);
            log::debug!(
                "Attempt {} for task {} ({} segments, {} done)",
                attempt,
                task_id,
                segments.len(),
                progress.chunk_count()
            );

            let result = match tokio::time::timeout(
                attempt_timeout,
                self.run_segments(&task, &segments, &progress),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(attempt_timeout)),
            };
            drop(permit.take());

            let error = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            if !error.is_retryable() || !policy.can_retry(attempt) {
                log::error!("Task {} failed after {} attempts: {}", task_id, attempt, error);
                self.queue.fail(&task_id, &error.to_string()).await;
                progress.finish(TaskOutcome::Failed {
                    message: error.to_string(),
                });
                return;
            }

            let delay = policy.backoff(attempt);
            log::warn!(
                "Attempt {} for task {} failed: {}; retrying in {:?}",
                attempt,
                task_id,
                error,
                delay
            );
            self.queue.record_retry(&task_id, &error.to_string(), delay).await;
            self.clock.sleep(delay).await;

            match self.permits.clone().acquire_owned().await {
                Ok(p) => permit = Some(p),
                Err(_) => {
                    self.queue.fail(&task_id, "worker stopped").await;
                    progress.finish(TaskOutcome::Failed {
                        message: "worker stopped".to_string(),
                    });
                    return;
                }
            }
        }

        self.store_result(&task, &progress).await;
    }

    /// Synthesize every segment not yet produced, appending each as a chunk.
    async fn run_segments(
        &self,
        task: &GenerationTask,
        segments: &[String],
        progress: &TaskProgress,
    ) -> Result<(), ProviderError> {
        for (segment_index, text) in segments.iter().enumerate().skip(progress.chunk_count()) {
            let request = SegmentRequest {
                text: text.clone(),
                voice: task.voice.clone(),
                language: task.language.clone(),
                segment_index,
            };
            let samples = self.provider.synthesize(&request).await?;
            if samples.is_empty() {
                return Err(ProviderError::EmptyOutput);
            }

            if let Some(chunk_index) = progress.push_chunk(&samples) {
                emit_event(
                    self.queue.emitter(),
                    channels::TASK_PROGRESS,
                    &TaskProgressEvent {
                        task_id: task.task_id.clone(),
                        chunk_index,
                        segment_count: segments.len(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Write the artifact and finish the task. Cache failures degrade to an
    /// uncached completion.
    async fn store_result(&self, task: &GenerationTask, progress: &TaskProgress) {
        let samples = progress.samples();
        let duration = codec::duration_secs(samples.len());
        let metadata = EntryMetadata {
            duration_seconds: duration,
            is_pregenerated: task.is_pregenerated,
        };

        let stored = match codec::wav_bytes(&samples) {
            Ok(wav) => match self.cache.put(&task.content_hash, &wav, metadata).await {
                Ok(_) => true,
                Err(e) => {
                    log::warn!("Caching audio for task {} failed: {}", task.task_id, e);
                    false
                }
            },
            Err(e) => {
                log::warn!("Encoding audio for task {} failed: {}", task.task_id, e);
                false
            }
        };

        let result_ref = stored.then(|| task.content_hash.clone());
        self.queue.complete(&task.task_id, result_ref).await;
        progress.finish(TaskOutcome::Completed {
            cached: stored,
            duration,
        });
        log::info!(
            "Task {} completed: {:.2}s of audio in {} chunks",
            task.task_id,
            duration,
            progress.chunk_count()
        );
    }

}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        log::error!("Generation task panicked: {}", e);
    }
}
