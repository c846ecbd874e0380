use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use voicecast::config::AppConfig;
use voicecast::core::logging::{self, AppError};
use voicecast::core::playback::{
    play_stream, AudioOutput, PlaybackEngine, PlaybackEvent, RodioOutput, StreamClient,
    VirtualOutput,
};
use voicecast::core::server::{StreamRequest, TtsServer};
use voicecast::core::voice::providers::{HttpProvider, HttpProviderConfig};
use voicecast::core::voice::{GenerationService, ServiceOptions};

/// How often the player polls its output for finished audio.
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Streaming speech synthesis server and player
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.config/voicecast/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the generation service and HTTP server (default)
    Serve,

    /// Stream text from a running server and play it
    Play {
        /// Server base URL, e.g. http://127.0.0.1:8791
        server: String,
        voice: String,
        language: String,
        /// Text to speak
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
        /// Play through a silent virtual output
        #[arg(long)]
        no_audio: bool,
    },
}

impl Command {
    fn request(voice: &str, language: &str, text: &[String]) -> StreamRequest {
        StreamRequest {
            text: text.join(" "),
            voice: voice.to_string(),
            language: language.to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .map_err(|e| {
        AppError::new(e.to_string())
            .with_help("Fix the config file or point --config at a valid one")
    })?;
    let _log_guard = logging::init(&config.data_dir().join("logs"));
    log::info!("{} v{} starting", voicecast::NAME, voicecast::VERSION);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Play {
            server,
            voice,
            language,
            text,
            no_audio,
        } => play(&server, &Command::request(&voice, &language, &text), no_audio).await,
    }
}

// ============================================================================
// serve
// ============================================================================

async fn serve(config: AppConfig) -> miette::Result<()> {
    let provider = Arc::new(HttpProvider::new(HttpProviderConfig {
        endpoint: config.provider.endpoint.clone(),
        api_key: config.provider.api_key.clone(),
        model: config.provider.model.clone(),
    }));

    let service = GenerationService::init(ServiceOptions::from_config(&config), provider)
        .await
        .map_err(|e| {
            AppError::new(format!("Failed to initialize generation service: {e}"))
                .with_help("Check that the data and cache directories are writable")
        })?;
    let service = Arc::new(service);
    service.start().await;

    let mut server = TtsServer::new(config.server.bind_addr.clone(), Arc::clone(&service));
    let addr = server.start().await.map_err(|e| {
        AppError::new(e.to_string())
            .with_help("Is another instance running? Set server.bind_addr or VOICECAST_SERVER__BIND_ADDR")
    })?;
    log::info!("Serving on http://{}", addr);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AppError::new(format!("Failed to listen for shutdown signal: {e}")))?;

    log::info!("Shutting down");
    // Draining ends the streams of queued tasks, which lets the server's
    // graceful shutdown finish
    tokio::join!(server.stop(), service.drain());
    Ok(())
}

// ============================================================================
// play
// ============================================================================

async fn play(server: &str, request: &StreamRequest, no_audio: bool) -> miette::Result<()> {
    let client = StreamClient::new(server)
        .map_err(|e| AppError::new(format!("Invalid server URL {server:?}: {e}")))?;

    if no_audio {
        let output = VirtualOutput::with_step(PUMP_INTERVAL.as_secs_f64());
        return run_player(&client, PlaybackEngine::new(output), request).await;
    }

    let output = RodioOutput::open_default().map_err(|e| {
        AppError::new(e.to_string()).with_help("Use --no-audio to stream without an output device")
    })?;
    run_player(&client, PlaybackEngine::new(output), request).await
}

async fn run_player<O: AudioOutput>(
    client: &StreamClient,
    mut engine: PlaybackEngine<O>,
    request: &StreamRequest,
) -> miette::Result<()> {
    let result = tokio::select! {
        result = play_stream(client, &mut engine, request, PUMP_INTERVAL, log_event) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted");
            Ok(())
        }
    };
    engine.stop();

    result.map_err(|e| {
        AppError::new(format!("Playback failed: {e}"))
            .with_help(format!("Is the server at {} running?", client.base_url()))
    })?;
    Ok(())
}

fn log_event(event: &PlaybackEvent) {
    match event {
        PlaybackEvent::Play { .. } => log::info!("Playing"),
        PlaybackEvent::StreamComplete { duration, audio_url } => log::info!(
            "Generation complete: {:.1}s{}",
            duration,
            audio_url
                .as_deref()
                .map(|url| format!(" ({url})"))
                .unwrap_or_default()
        ),
        PlaybackEvent::Error { message } => log::warn!("Stream error: {}", message),
        PlaybackEvent::Ended => log::info!("Playback finished"),
        other => log::debug!("{:?}", other),
    }
}
