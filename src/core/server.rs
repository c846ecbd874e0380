//! TTS HTTP Service
//!
//! ## Endpoints
//! - `POST /tts/stream` - SSE audio stream for `{text, voice, language}`
//! - `GET /tts/cache/{hash}` - Cached WAV file
//! - `DELETE /tts/cache/{hash}` - Invalidate cached audio
//! - `GET /tts/status/{hash}` - Audio availability
//! - `POST /tts/pregenerate` - Queue background generation
//! - `GET /tts/tasks/{task_id}` - Task record
//! - `GET /tts/stats` - Cache and queue statistics
//! - `GET /health` - Health check

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{sse::Event, sse::KeepAlive, IntoResponse, Response, Sse},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::voice::preprocess::is_content_hash;
use crate::core::voice::service::GenerationService;
use crate::core::voice::types::{GenerationError, TaskPriority};

const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub text: String,
    pub voice: String,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PregenerateRequest {
    pub text: String,
    pub voice: String,
    pub language: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server already running")]
    AlreadyRunning,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct TtsServer {
    bind_addr: String,
    service: Arc<GenerationService>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TtsServer {
    pub fn new(bind_addr: impl Into<String>, service: Arc<GenerationService>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            service,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Build the router
    pub fn router(service: Arc<GenerationService>) -> Router {
        Router::new()
            .route("/tts/stream", post(stream_audio))
            .route("/tts/cache/:hash", get(get_cached_audio).delete(invalidate_audio))
            .route("/tts/status/:hash", get(audio_status))
            .route("/tts/pregenerate", post(pregenerate))
            .route("/tts/tasks/:task_id", get(get_task))
            .route("/tts/stats", get(stats))
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .with_state(service)
    }

    /// Bind and start serving in the background. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.shutdown_tx.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.bind_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.bind_addr.clone(),
            source,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = Self::router(self.service.clone());

        self.handle = Some(tokio::spawn(async move {
            log::info!("TTS service listening on http://{}", addr);
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    log::info!("TTS service shutting down");
                })
                .await
            {
                log::error!("TTS service error: {}", e);
            }
        }));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(addr)
    }

    /// Stop accepting connections and wait for open ones to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            log::info!("TTS service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn stream_audio(
    State(service): State<Arc<GenerationService>>,
    Json(request): Json<StreamRequest>,
) -> Response {
    match service
        .stream(&request.text, &request.voice, &request.language)
        .await
    {
        Ok(events) => {
            let frames = events.map(|event| {
                Ok::<_, Infallible>(Event::default().event(event.name()).data(event.data_json()))
            });
            Sse::new(frames)
                .keep_alive(KeepAlive::new())
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_cached_audio(
    State(service): State<Arc<GenerationService>>,
    Path(hash): Path<String>,
) -> Response {
    if !is_content_hash(&hash) {
        return not_found(&hash);
    }
    match service.audio(&hash).await {
        Ok(Some(bytes)) => (
            [
                (header::CONTENT_TYPE, "audio/wav"),
                (header::CACHE_CONTROL, IMMUTABLE_CACHE_CONTROL),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) => not_found(&hash),
        Err(e) => error_response(e),
    }
}

async fn invalidate_audio(
    State(service): State<Arc<GenerationService>>,
    Path(hash): Path<String>,
) -> Response {
    match service.invalidate(&hash).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(&hash),
        Err(e) => error_response(e),
    }
}

async fn audio_status(
    State(service): State<Arc<GenerationService>>,
    Path(hash): Path<String>,
) -> Response {
    Json(service.status(&hash).await).into_response()
}

async fn pregenerate(
    State(service): State<Arc<GenerationService>>,
    Json(request): Json<PregenerateRequest>,
) -> Response {
    let priority = request.priority.unwrap_or(TaskPriority::Low);
    match service
        .pregenerate(&request.text, &request.voice, &request.language, priority)
        .await
    {
        Ok(submission) => Json(serde_json::json!({
            "task_id": submission.task_id,
            "status": submission.status,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_task(
    State(service): State<Arc<GenerationService>>,
    Path(task_id): Path<String>,
) -> Response {
    match service.task(&task_id) {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stats(State(service): State<Arc<GenerationService>>) -> Response {
    Json(service.stats().await).into_response()
}

fn not_found(what: &str) -> Response {
    error_response(GenerationError::NotFound(what.to_string()))
}

/// Convert GenerationError to HTTP error response
fn error_response(error: GenerationError) -> Response {
    let (status, error_type) = match &error {
        GenerationError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        GenerationError::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
        GenerationError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
        GenerationError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
        log::error!("Request failed: {}", error);
    }

    (
        status,
        Json(serde_json::json!({
            "error": {
                "message": error.to_string(),
                "type": error_type
            }
        })),
    )
        .into_response()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::streaming::{SseParser, StreamEvent};
    use crate::core::voice::cache::{CacheConfig, EntryMetadata};
    use crate::core::voice::codec;
    use crate::core::voice::preprocess::DefaultPreprocessor;
    use crate::core::voice::providers::MockSynthesisProvider;
    use crate::core::voice::queue::{NoopEmitter, QueueConfig, SystemClock};
    use crate::core::voice::service::ServiceOptions;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_service(dir: &TempDir, provider: MockSynthesisProvider, capacity: usize) -> Arc<GenerationService> {
        let options = ServiceOptions {
            cache_dir: dir.path().join("audio"),
            cache: CacheConfig::default(),
            queue: QueueConfig {
                capacity,
                ..Default::default()
            },
            max_text_chars: 1000,
            segment_max_chars: 400,
            public_base_url: None,
        };
        Arc::new(
            GenerationService::init_with(
                options,
                Arc::new(provider),
                Arc::new(DefaultPreprocessor),
                Arc::new(NoopEmitter),
                Arc::new(SystemClock),
            )
            .await
            .unwrap(),
        )
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_cache(service: &GenerationService, text: &str) -> String {
        let hash = service.prepare(text, "A", "en").unwrap().content_hash;
        let wav = codec::wav_bytes(&vec![0i16; 24_000]).unwrap();
        service
            .cache()
            .put(&hash, &wav, EntryMetadata { duration_seconds: 1.0, is_pregenerated: false })
            .await
            .unwrap();
        hash
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let app = TtsServer::router(test_service(&dir, MockSynthesisProvider::new(), 10).await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_stream_cache_hit_emits_single_cached_event() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, MockSynthesisProvider::new(), 10).await;
        let hash = seed_cache(&service, "cached words").await;

        let response = TtsServer::router(service)
            .oneshot(json_request(
                "POST",
                "/tts/stream",
                serde_json::json!({"text": "cached words", "voice": "A", "language": "en"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let frames = SseParser::new().push(&bytes);
        let events: Vec<_> = frames
            .iter()
            .map(|f| StreamEvent::from_frame(f).unwrap())
            .collect();
        assert_eq!(
            events,
            vec![StreamEvent::Cached {
                audio_url: format!("/tts/cache/{hash}"),
                duration: 1.0
            }]
        );
    }

    #[tokio::test]
    async fn test_stream_validation_error_is_400() {
        let dir = TempDir::new().unwrap();
        let app = TtsServer::router(test_service(&dir, MockSynthesisProvider::new(), 10).await);
        let response = app
            .oneshot(json_request(
                "POST",
                "/tts/stream",
                serde_json::json!({"text": "  ", "voice": "A", "language": "en"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn test_cached_audio_headers_and_miss() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, MockSynthesisProvider::new(), 10).await;
        let hash = seed_cache(&service, "file please").await;
        let app = TtsServer::router(service);

        let response = app
            .clone()
            .oneshot(Request::get(format!("/tts/cache/{hash}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
        assert_eq!(response.headers()[header::CACHE_CONTROL], IMMUTABLE_CACHE_CONTROL);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(codec::read_wav(&bytes).unwrap().len(), 24_000);

        let missing = "0".repeat(64);
        let response = app
            .clone()
            .oneshot(Request::get(format!("/tts/cache/{missing}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/tts/cache/..%2Fsecret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_and_delete() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, MockSynthesisProvider::new(), 10).await;
        let hash = seed_cache(&service, "status words").await;
        let app = TtsServer::router(service);

        let response = app
            .clone()
            .oneshot(Request::get(format!("/tts/status/{hash}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = body_json(response).await;
        assert_eq!(status["has_audio"], true);
        assert_eq!(status["duration"], 1.0);
        assert_eq!(status["audio_url"], format!("/tts/cache/{hash}"));

        let delete = || {
            Request::delete(format!("/tts/cache/{hash}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pregenerate_and_task_lookup() {
        let dir = TempDir::new().unwrap();
        let app = TtsServer::router(test_service(&dir, MockSynthesisProvider::new(), 1).await);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/tts/pregenerate",
                serde_json::json!({"text": "first", "voice": "A", "language": "en", "priority": "high"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(Request::get(format!("/tts/tasks/{task_id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let task = body_json(response).await;
        assert_eq!(task["priority"], "high");
        assert_eq!(task["is_pregenerated"], true);

        // Capacity of one: a different text is rejected
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/tts/pregenerate",
                serde_json::json!({"text": "second", "voice": "A", "language": "en"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/tts/pregenerate",
                serde_json::json!({"text": "x", "voice": "bad voice", "language": "en"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(Request::get("/tts/tasks/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, MockSynthesisProvider::new(), 10).await;
        seed_cache(&service, "stats").await;
        let response = TtsServer::router(service)
            .oneshot(Request::get("/tts/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats = body_json(response).await;
        assert_eq!(stats["cache"]["entry_count"], 1);
        assert_eq!(stats["queue"]["capacity"], 10);
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, MockSynthesisProvider::new(), 10).await;
        let mut server = TtsServer::new("127.0.0.1:0", service);
        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        server.stop().await;
        assert!(!server.is_running());
    }
}
