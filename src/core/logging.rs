//! Logging Module
//!
//! - JSON file log with daily rotation (tracing-appender)
//! - Human readable stdout log
//! - `log` macros bridged into `tracing`
//! - miette diagnostics for fatal errors

use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use miette::Diagnostic;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "voicecast.log";

// ============================================================================
// Logging Initialization
// ============================================================================

/// Initialize the logging system.
///
/// Returns a `WorkerGuard` which must be kept alive for the duration of the
/// application so buffered file logs are flushed on shutdown.
pub fn init(log_dir: &Path) -> WorkerGuard {
    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("Failed to create logs directory {:?}: {}", log_dir, e);
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // File Layer: JSON format for easy parsing/ingestion
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .json()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_filter(env_filter.clone());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(io::stdout().is_terminal())
        .with_target(false)
        .with_filter(env_filter);

    // `try_init` also installs the log -> tracing bridge
    if let Err(e) = tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
    {
        eprintln!("Logging already initialized: {}", e);
    }

    init_miette();

    let log_dir = log_dir.to_path_buf();
    log::info!(
        "Logging initialized. Writing to: {:?} (daily rolling)",
        log_dir.join(LOG_FILE_PREFIX)
    );
    std::thread::spawn(move || compress_old_logs(&log_dir));

    guard
}

/// Gzip rolled log files from previous days.
fn compress_old_logs(log_dir: &Path) {
    let today_suffix = chrono::Local::now().format("%Y-%m-%d").to_string();

    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };
    for path in entries.flatten().map(|e| e.path()) {
        if !should_compress(&path, &today_suffix) {
            continue;
        }
        match compress_file(&path) {
            Ok(()) => log::debug!("Compressed old log: {:?}", path),
            Err(e) => log::warn!("Failed to compress old log {:?}: {}", path, e),
        }
    }
}

fn should_compress(path: &Path, today_suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| {
            name.starts_with(&format!("{LOG_FILE_PREFIX}."))
                && !name.ends_with(today_suffix)
                && !name.ends_with(".gz")
        })
        .unwrap_or(false)
}

fn compress_file(path: &Path) -> io::Result<()> {
    let mut gz_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "No filename"))?
        .to_os_string();
    gz_name.push(".gz");
    let gz_path: PathBuf = path.with_file_name(gz_name);

    // Skip if already exists
    if gz_path.exists() {
        return Ok(());
    }

    let mut reader = io::BufReader::new(fs::File::open(path)?);
    let mut encoder = GzEncoder::new(fs::File::create(&gz_path)?, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;

    fs::remove_file(path)
}

/// Initialize miette for error reporting
fn init_miette() {
    let colorize = io::stderr().is_terminal();

    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .unicode(colorize)
                .context_lines(3)
                .tab_width(4)
                .break_words(true)
                .color(colorize)
                .build(),
        )
    }))
    .ok(); // Ignore if already set
}

// ============================================================================
// Diagnostic Error Types (miette integration)
// ============================================================================

/// Fatal application error with optional help text
#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code("voicecast::error"))]
pub struct AppError {
    message: String,

    #[help]
    help_text: Option<String>,
}

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            help_text: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help_text = Some(help.into());
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
