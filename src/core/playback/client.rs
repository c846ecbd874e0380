//! Stream client
//!
//! Opens `POST /tts/stream`, parses the SSE body incrementally and feeds a
//! [`PlaybackEngine`]. The returned stream is abortable; the engine aborts it
//! on `stop()`, which drops the response and closes the connection.

use std::time::Duration;

use bytes::Bytes;
use futures::future::AbortHandle;
use futures::stream::{self, Abortable, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use url::Url;

use super::engine::{PlaybackEngine, PlaybackEvent};
use super::output::AudioOutput;
use crate::core::server::StreamRequest;
use crate::core::streaming::{
    chunk_index_hint, ProtocolError, SseParser, StreamEvent, StreamSequencer,
};
use crate::core::voice::codec::{self, CodecError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Audio error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream ended before completion")]
    Truncated,
}

/// Ordered, validated stream events.
pub type EventStream = Abortable<BoxStream<'static, Result<StreamEvent, ClientError>>>;

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    base_url: Url,
}

impl StreamClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves a server path (or absolute URL) against the base URL.
    pub fn resolve(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    /// Opens a stream. Events come out in protocol order; the stream ends
    /// after `complete`, `error` or `cached`, and yields
    /// [`ClientError::Truncated`] if the body ends before any of those.
    pub async fn open(
        &self,
        request: &StreamRequest,
    ) -> Result<(EventStream, AbortHandle), ClientError> {
        let url = self.resolve("/tts/stream")?;
        log::debug!("Opening stream {}", url);

        let response = self
            .http
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let events = decode_events(response.bytes_stream());
        Ok(stream::abortable(events.boxed()))
    }

    /// Downloads a cached WAV file and returns its samples.
    pub async fn fetch_audio(&self, audio_url: &str) -> Result<Vec<i16>, ClientError> {
        let url = self.resolve(audio_url)?;
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        Ok(codec::read_wav(&bytes)?)
    }
}

/// Turns a raw SSE body into validated stream events.
fn decode_events(
    body: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<StreamEvent, ClientError>> + Send + 'static {
    async_stream::try_stream! {
        futures::pin_mut!(body);
        let mut parser = SseParser::new();
        let mut sequencer = StreamSequencer::new();

        'read: while let Some(bytes) = body.next().await {
            let bytes = bytes?;
            for frame in parser.push(&bytes) {
                let event = match StreamEvent::from_frame(&frame) {
                    Ok(event) => event,
                    Err(ProtocolError::InvalidPayload { event: name, source })
                        if name == StreamEvent::CHUNK =>
                    {
                        log::warn!("Dropping unreadable chunk: {}", source);
                        sequencer.skip_unreadable_chunk(chunk_index_hint(&frame));
                        continue;
                    }
                    Err(e) => Err::<StreamEvent, _>(e)?,
                };
                let Some(event) = sequencer.accept(event)? else {
                    continue;
                };
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break 'read;
                }
            }
        }

        if !sequencer.is_finished() && !sequencer.is_cached() {
            Err::<(), _>(ClientError::Truncated)?;
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Plays one stream through `engine` until playback ends or the session is
/// stopped. Transport failures become engine error events; whatever was
/// already scheduled keeps playing. `tick` is how often output
/// notifications are polled.
pub async fn play_stream<O: AudioOutput>(
    client: &StreamClient,
    engine: &mut PlaybackEngine<O>,
    request: &StreamRequest,
    tick: Duration,
    mut on_event: impl FnMut(&PlaybackEvent),
) -> Result<(), ClientError> {
    let (mut stream, abort) = client.open(request).await?;
    let mut events = engine.load_stream(Some(abort));

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stream_open = true;

    loop {
        tokio::select! {
            item = stream.next(), if stream_open => match item {
                Some(Ok(event)) => apply_event(client, engine, event).await,
                Some(Err(e)) => {
                    stream_open = false;
                    engine.on_stream_error(e.to_string());
                }
                None => {
                    stream_open = false;
                    let finished = engine
                        .session()
                        .map(|s| s.is_stream_finished())
                        .unwrap_or(true);
                    if !finished {
                        engine.on_stream_error("Stream closed");
                    }
                }
            },
            _ = ticker.tick() => engine.pump(),
        }

        let mut done = false;
        while let Ok(event) = events.try_recv() {
            done |= matches!(event, PlaybackEvent::Ended | PlaybackEvent::Stopped);
            on_event(&event);
        }
        if done {
            return Ok(());
        }
    }
}

async fn apply_event<O: AudioOutput>(
    client: &StreamClient,
    engine: &mut PlaybackEngine<O>,
    event: StreamEvent,
) {
    match event {
        StreamEvent::Cached { audio_url, .. } => match client.fetch_audio(&audio_url).await {
            Ok(pcm) => engine.on_cached_audio(&pcm),
            Err(e) => engine.on_stream_error(format!("Failed to fetch {audio_url}: {e}")),
        },
        StreamEvent::Chunk { index, data } => engine.on_chunk(index, &data),
        StreamEvent::Complete { audio_url, .. } => engine.on_stream_complete(audio_url),
        StreamEvent::Error { message } => engine.on_stream_error(message),
    }
}
