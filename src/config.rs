use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::voice::cache::CacheConfig;
use crate::core::voice::queue::retry::RetryPolicy;
use crate::core::voice::queue::QueueConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration ({path}): {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueSettings,
    pub cache: CacheSettings,
    pub provider: ProviderSettings,
    pub data: DataConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the HTTP surface binds to.
    pub bind_addr: String,
    /// Base URL used when building `audio_url` values. Relative URLs are
    /// emitted when unset.
    pub public_base_url: Option<String>,
}

/// Generation queue and worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum number of pending + processing tasks.
    pub capacity: usize,
    /// Maximum concurrent provider calls.
    pub max_concurrent: usize,
    /// Attempts per task, including the first one.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles on each further failure.
    pub backoff_base_secs: u64,
    /// Upper bound for a single backoff delay.
    pub backoff_max_secs: u64,
    /// Timeout applied to each attempt (reset on retry).
    pub attempt_timeout_secs: u64,
    /// Number of terminal tasks kept in the persisted registry.
    pub registry_retention: usize,
    /// Longest accepted input, in characters after normalization.
    pub max_text_chars: usize,
}

/// Audio cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Override the cache directory (defaults to `<data_dir>/audio`).
    pub dir: Option<PathBuf>,
    /// Total size budget in megabytes.
    pub max_size_mb: u64,
}

/// Synthesis provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Base URL of an OpenAI-compatible speech endpoint returning raw PCM.
    pub endpoint: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Model name forwarded to the provider.
    pub model: Option<String>,
    /// Longest text segment sent in one provider call.
    pub segment_max_chars: usize,
}

/// Data directory configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Override the default data directory.
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            public_base_url: None,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_concurrent: 2,
            max_attempts: 3,
            backoff_base_secs: 1,
            backoff_max_secs: 60,
            attempt_timeout_secs: 600,
            registry_retention: 1000,
            max_text_chars: 100_000,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            max_size_mb: 500,
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8880".to_string(),
            api_key: None,
            model: None,
            segment_max_chars: 400,
        }
    }
}

impl AppConfig {
    /// Load configuration from `~/.config/voicecast/config.toml`, overlaid
    /// with `VOICECAST_<SECTION>__<FIELD>` environment variables.
    /// A missing file means defaults; a file that does not parse is an error.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
        }

        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("VOICECAST_").split("__"))
            .extract::<AppConfig>()
            .map_err(|e| ConfigError::Invalid {
                path: path.to_path_buf(),
                source: Box::new(e),
            })
    }

    /// Resolved data directory (override or XDG default).
    pub fn data_dir(&self) -> PathBuf {
        self.data.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("voicecast"))
                .unwrap_or_else(|| PathBuf::from("data"))
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("audio"))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir().join("tasks.json")
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size_bytes: self.cache.max_size_mb.saturating_mul(1024 * 1024),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue.capacity,
            max_concurrent: self.queue.max_concurrent.max(1),
            retry: RetryPolicy {
                max_attempts: self.queue.max_attempts.max(1),
                base_delay: Duration::from_secs(self.queue.backoff_base_secs),
                max_delay: Duration::from_secs(self.queue.backoff_max_secs),
            },
            attempt_timeout: Duration::from_secs(self.queue.attempt_timeout_secs),
            registry_path: Some(self.registry_path()),
            registry_retention: self.queue.registry_retention,
        }
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("voicecast").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }
}
