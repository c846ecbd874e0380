//! Generation Service
//!
//! Owns the cache, queue and worker and exposes the operations the HTTP
//! surface and file-watch triggers call.

use std::path::PathBuf;
use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::cache::{AudioCache, CacheConfig, CacheStats};
use super::preprocess::{prepare_request, DefaultPreprocessor, TextPreprocessor, TextSegmenter};
use super::providers::SynthesisProvider;
use super::queue::{
    Clock, GenerationQueue, GenerationWorker, LogEmitter, ProgressUpdate, QueueConfig,
    QueueEventEmitter, QueueStats, Submission, SystemClock, TaskOutcome,
};
use super::types::{
    GenerationError, GenerationTask, PreparedRequest, Result, TaskPriority, TaskStatus,
};
use crate::config::AppConfig;
use crate::core::streaming::StreamEvent;

/// Everything the service needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub cache_dir: PathBuf,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub max_text_chars: usize,
    pub segment_max_chars: usize,
    /// Prefix for `audio_url` values; relative URLs when unset
    pub public_base_url: Option<String>,
}

impl ServiceOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cache_dir: config.cache_dir(),
            cache: config.cache_config(),
            queue: config.queue_config(),
            max_text_chars: config.queue.max_text_chars,
            segment_max_chars: config.provider.segment_max_chars,
            public_base_url: config.server.public_base_url.clone(),
        }
    }
}

/// Availability of audio for a content hash.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioStatus {
    pub has_audio: bool,
    /// `completed` when cached, the active task's status when generating,
    /// `failed` when the latest generation failed, `none` otherwise
    pub status: String,
    pub audio_url: Option<String>,
    pub duration: Option<f64>,
    /// Error of the failed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub queue: QueueStats,
}

pub struct GenerationService {
    cache: Arc<AudioCache>,
    queue: Arc<GenerationQueue>,
    worker: GenerationWorker,
    preprocessor: Arc<dyn TextPreprocessor>,
    max_text_chars: usize,
    public_base_url: Option<String>,
    shutdown_tx: watch::Sender<bool>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl GenerationService {
    /// Open the cache, restore the task registry and wire up the worker.
    /// Nothing is generated until `start`.
    pub async fn init(options: ServiceOptions, provider: Arc<dyn SynthesisProvider>) -> Result<Self> {
        Self::init_with(
            options,
            provider,
            Arc::new(DefaultPreprocessor),
            Arc::new(LogEmitter),
            Arc::new(SystemClock),
        )
        .await
    }

    pub async fn init_with(
        options: ServiceOptions,
        provider: Arc<dyn SynthesisProvider>,
        preprocessor: Arc<dyn TextPreprocessor>,
        emitter: Arc<dyn QueueEventEmitter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cache = Arc::new(AudioCache::open(options.cache_dir.clone(), options.cache.clone()).await?);
        let queue = Arc::new(GenerationQueue::new(options.queue.clone(), emitter));
        queue.load().await?;

        let worker = GenerationWorker::new(
            queue.clone(),
            provider,
            cache.clone(),
            TextSegmenter::new(options.segment_max_chars),
            clock,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            cache,
            queue,
            worker,
            preprocessor,
            max_text_chars: options.max_text_chars,
            public_base_url: options
                .public_base_url
                .map(|url| url.trim_end_matches('/').to_string()),
            shutdown_tx,
            worker_handle: Mutex::new(None),
        })
    }

    /// Spawn the dispatcher. Calling it twice has no effect.
    pub async fn start(&self) {
        let mut handle = self.worker_handle.lock().await;
        if handle.is_some() {
            return;
        }
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(self.worker.clone().run(shutdown_rx)));
    }

    /// Stop dispatching, wait for in-flight tasks and flush cache metadata.
    /// Pending tasks stay in the registry for the next start.
    pub async fn drain(&self) {
        log::info!("Draining generation service");
        self.queue.close().await;
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.worker_handle.lock().await.take() {
            if let Err(e) = handle.await {
                log::error!("Generation worker ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.cache.flush().await {
            log::warn!("Failed to flush cache metadata: {}", e);
        }
    }

    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<GenerationQueue> {
        &self.queue
    }

    pub fn audio_url(&self, content_hash: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/tts/cache/{content_hash}"),
            None => format!("/tts/cache/{content_hash}"),
        }
    }

    /// Normalize and validate a request.
    pub fn prepare(&self, text: &str, voice: &str, language: &str) -> Result<PreparedRequest> {
        prepare_request(self.preprocessor.as_ref(), text, voice, language, self.max_text_chars)
    }

    /// Queue text for generation (file-watch entry point).
    pub async fn enqueue(&self, text: &str, voice: &str, language: &str) -> Result<Submission> {
        self.pregenerate(text, voice, language, TaskPriority::Normal).await
    }

    /// Queue text for background generation. Already cached content is
    /// recorded as a skipped task without touching the provider.
    pub async fn pregenerate(
        &self,
        text: &str,
        voice: &str,
        language: &str,
        priority: TaskPriority,
    ) -> Result<Submission> {
        let mut request = self.prepare(text, voice, language)?;
        request.priority = priority;
        request.pregenerate = true;

        if self.cache.contains(&request.content_hash).await {
            return self.queue.record_skipped(&request).await;
        }
        self.queue.enqueue(&request).await
    }

    /// Open an audio stream for text. Validation and admission errors are
    /// returned before any event is produced.
    pub async fn stream(
        &self,
        text: &str,
        voice: &str,
        language: &str,
    ) -> Result<impl Stream<Item = StreamEvent> + Send + 'static> {
        let mut request = self.prepare(text, voice, language)?;
        request.priority = TaskPriority::High;
        let content_hash = request.content_hash.clone();
        let audio_url = self.audio_url(&content_hash);

        let cached = self.cache.lookup(&content_hash).await;
        let progress = match cached {
            Some(_) => None,
            None => {
                let submission = self.queue.enqueue(&request).await?;
                log::debug!(
                    "Streaming task {} (joined: {})",
                    submission.task_id,
                    submission.joined
                );
                self.queue.progress(&submission.task_id)
            }
        };

        // The task may have finished between enqueue and subscribing
        let late_hit = match (&cached, &progress) {
            (None, None) => self.cache.peek(&content_hash).await,
            _ => None,
        };
        let cache_hit = cached.or(late_hit);

        Ok(async_stream::stream! {
            if let Some(entry) = cache_hit {
                yield StreamEvent::Cached { audio_url, duration: entry.duration_seconds };
                return;
            }

            let Some(progress) = progress else {
                yield StreamEvent::Error { message: "generation result unavailable".to_string() };
                return;
            };

            let mut subscription = progress.subscribe();
            let mut chunks_sent = 0u64;
            while let Some(update) = subscription.next().await {
                match update {
                    ProgressUpdate::Chunk(chunk) => {
                        chunks_sent += 1;
                        yield StreamEvent::Chunk { index: chunk.index, data: chunk.data.to_string() };
                    }
                    ProgressUpdate::Finished(TaskOutcome::Completed { cached, duration }) => {
                        yield StreamEvent::Complete {
                            audio_url: cached.then(|| audio_url.clone()),
                            duration,
                        };
                    }
                    ProgressUpdate::Finished(TaskOutcome::Skipped { duration }) => {
                        if chunks_sent == 0 {
                            yield StreamEvent::Cached { audio_url: audio_url.clone(), duration };
                        } else {
                            yield StreamEvent::Complete { audio_url: Some(audio_url.clone()), duration };
                        }
                    }
                    ProgressUpdate::Finished(TaskOutcome::Failed { message }) => {
                        yield StreamEvent::Error { message };
                    }
                }
            }
        })
    }

    pub async fn status(&self, content_hash: &str) -> AudioStatus {
        if let Some(entry) = self.cache.peek(content_hash).await {
            return AudioStatus {
                has_audio: true,
                status: "completed".to_string(),
                audio_url: Some(self.audio_url(content_hash)),
                duration: Some(entry.duration_seconds),
                error: None,
            };
        }

        let task = self
            .queue
            .find_active(content_hash)
            .map(|(task, _)| task)
            .or_else(|| {
                self.queue
                    .latest_for_hash(content_hash)
                    .filter(|task| task.status == TaskStatus::Failed)
            });
        AudioStatus {
            has_audio: false,
            status: task
                .as_ref()
                .map(|t| t.status.as_str())
                .unwrap_or("none")
                .to_string(),
            audio_url: None,
            duration: None,
            error: task.and_then(|t| t.error),
        }
    }

    /// Read a cached file, counting the access.
    pub async fn audio(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        if self.cache.lookup(content_hash).await.is_none() {
            return Ok(None);
        }
        match self.cache.read(content_hash).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(super::cache::CacheError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop cached audio after its source text changed.
    pub async fn invalidate(&self, content_hash: &str) -> Result<bool> {
        Ok(self.cache.invalidate(content_hash).await?)
    }

    pub fn task(&self, task_id: &str) -> Result<GenerationTask> {
        self.queue
            .get(task_id)
            .ok_or_else(|| GenerationError::NotFound(task_id.to_string()))
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats().await,
            queue: self.queue.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::voice::cache::EntryMetadata;
    use crate::core::voice::codec;
    use crate::core::voice::providers::{MockSynthesisProvider, SegmentRequest};
    use crate::core::voice::queue::NoopEmitter;
    use crate::core::voice::types::{ProviderError, TaskStatus};
    use futures::StreamExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> ServiceOptions {
        ServiceOptions {
            cache_dir: dir.path().join("audio"),
            cache: CacheConfig::default(),
            queue: QueueConfig {
                registry_path: Some(dir.path().join("tasks.json")),
                ..Default::default()
            },
            max_text_chars: 1000,
            segment_max_chars: 400,
            public_base_url: Some("http://host:1/".into()),
        }
    }

    async fn service(dir: &TempDir, provider: MockSynthesisProvider) -> GenerationService {
        GenerationService::init_with(
            options(dir),
            Arc::new(provider),
            Arc::new(DefaultPreprocessor),
            Arc::new(NoopEmitter),
            Arc::new(SystemClock),
        )
        .await
        .unwrap()
    }

    fn working_provider() -> MockSynthesisProvider {
        let mut mock = MockSynthesisProvider::new();
        mock.expect_id().return_const("mock");
        mock.expect_synthesize()
            .returning(|_: &SegmentRequest| Ok(vec![500; 2400]));
        mock
    }

    #[tokio::test]
    async fn test_stream_generates_then_serves_from_cache() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, working_provider()).await;
        svc.start().await;

        let events: Vec<_> = svc.stream("Hello there.", "A", "en").await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Chunk { index: 1, .. }));
        let hash = svc.prepare("Hello there.", "A", "en").unwrap().content_hash;
        assert_eq!(
            events[1],
            StreamEvent::Complete {
                audio_url: Some(format!("http://host:1/tts/cache/{hash}")),
                duration: 0.1
            }
        );

        let again: Vec<_> = svc.stream("Hello   there.", "A", "en").await.unwrap().collect().await;
        assert_eq!(
            again,
            vec![StreamEvent::Cached {
                audio_url: format!("http://host:1/tts/cache/{hash}"),
                duration: 0.1
            }]
        );

        svc.drain().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_identical_streams_call_provider_once() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockSynthesisProvider::new();
        mock.expect_id().return_const("mock");
        mock.expect_synthesize().times(1).returning(|_: &SegmentRequest| {
            // keep the task in flight while the other listeners join
            std::thread::sleep(Duration::from_millis(150));
            Ok(vec![250; 4800])
        });
        let svc = service(&dir, mock).await;
        svc.start().await;

        let streams = futures::future::join_all(
            (0..8).map(|_| svc.stream("Say it once.", "A", "en")),
        )
        .await;
        let outputs = futures::future::join_all(
            streams
                .into_iter()
                .map(|stream| stream.unwrap().collect::<Vec<StreamEvent>>()),
        )
        .await;

        let first = &outputs[0];
        assert_eq!(first.len(), 2, "unexpected events: {first:?}");
        assert!(matches!(&first[0], StreamEvent::Chunk { index: 1, .. }));
        assert!(matches!(&first[1], StreamEvent::Complete { audio_url: Some(_), .. }));
        for output in &outputs[1..] {
            assert_eq!(output, first);
        }
        assert_eq!(svc.stats().await.queue.completed, 1);
        svc.drain().await;
    }

    #[tokio::test]
    async fn test_stream_rejects_invalid_text() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, MockSynthesisProvider::new()).await;
        let result = svc.stream("   ", "A", "en").await;
        assert!(matches!(result, Err(GenerationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_stream_reports_failure_as_error_event() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockSynthesisProvider::new();
        mock.expect_id().return_const("mock");
        mock.expect_synthesize()
            .times(1)
            .returning(|_| Err(ProviderError::Rejected("bad voice".into())));
        let svc = service(&dir, mock).await;
        svc.start().await;

        let events: Vec<_> = svc.stream("hi", "A", "en").await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("bad voice")));
        svc.drain().await;
    }

    #[tokio::test]
    async fn test_status_reports_failed_generation() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockSynthesisProvider::new();
        mock.expect_id().return_const("mock");
        mock.expect_synthesize()
            .times(1)
            .returning(|_| Err(ProviderError::Rejected("unknown voice".into())));
        let svc = service(&dir, mock).await;
        svc.start().await;
        let hash = svc.prepare("doomed text", "A", "en").unwrap().content_hash;

        let events: Vec<_> = svc.stream("doomed text", "A", "en").await.unwrap().collect().await;
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));

        let status = svc.status(&hash).await;
        assert!(!status.has_audio);
        assert_eq!(status.status, "failed");
        assert!(status.error.as_deref().is_some_and(|e| e.contains("unknown voice")));

        let other = svc.prepare("never asked", "A", "en").unwrap().content_hash;
        assert_eq!(svc.status(&other).await.status, "none");
        assert_eq!(svc.status(&other).await.error, None);
        svc.drain().await;
    }

    #[tokio::test]
    async fn test_pregenerate_cached_content_is_skipped() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, MockSynthesisProvider::new()).await;
        let hash = svc.prepare("cached text", "A", "en").unwrap().content_hash;
        let wav = codec::wav_bytes(&[0i16; 240]).unwrap();
        svc.cache()
            .put(&hash, &wav, EntryMetadata { duration_seconds: 0.01, is_pregenerated: false })
            .await
            .unwrap();

        let submission = svc
            .pregenerate("cached text", "A", "en", TaskPriority::Low)
            .await
            .unwrap();
        assert_eq!(submission.status, TaskStatus::Skipped);
        assert_eq!(svc.task(&submission.task_id).unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_status_and_invalidate() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, working_provider()).await;
        let hash = svc.prepare("status text", "A", "en").unwrap().content_hash;

        assert_eq!(svc.status(&hash).await.status, "none");

        svc.enqueue("status text", "A", "en").await.unwrap();
        assert_eq!(svc.status(&hash).await.status, "pending");

        svc.start().await;
        for _ in 0..100 {
            if svc.status(&hash).await.has_audio {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = svc.status(&hash).await;
        assert!(status.has_audio);
        assert_eq!(status.duration, Some(0.1));
        assert!(svc.audio(&hash).await.unwrap().is_some());

        assert!(svc.invalidate(&hash).await.unwrap());
        assert!(!svc.status(&hash).await.has_audio);
        assert!(svc.audio(&hash).await.unwrap().is_none());
        svc.drain().await;
    }

    #[tokio::test]
    async fn test_pending_tasks_survive_drain_and_restart() {
        let dir = TempDir::new().unwrap();
        let task_id = {
            let svc = service(&dir, MockSynthesisProvider::new()).await;
            let submission = svc.enqueue("later", "A", "en").await.unwrap();
            svc.drain().await;
            submission.task_id
        };

        let svc = service(&dir, working_provider()).await;
        assert_eq!(svc.task(&task_id).unwrap().status, TaskStatus::Pending);
        svc.start().await;
        for _ in 0..100 {
            if svc.task(&task_id).unwrap().status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.task(&task_id).unwrap().status, TaskStatus::Completed);
        svc.drain().await;
    }
}
