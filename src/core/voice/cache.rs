//! Audio Cache
//!
//! Content-addressable store of finished audio with LRU eviction.
//! One WAV file per content hash plus a `metadata.json` sidecar that keeps
//! access statistics across restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::codec;
use super::fsio::{write_atomic, TEMP_SUFFIX};

// ============================================================================
// Constants
// ============================================================================

/// Default maximum cache size: 500 MB
const DEFAULT_MAX_SIZE_BYTES: u64 = 500 * 1024 * 1024;

const METADATA_FILE: &str = "metadata.json";
const AUDIO_EXTENSION: &str = "wav";
const WAV_HEADER_BYTES: u64 = 44;

// ============================================================================
// Cache Types
// ============================================================================

/// A single cached audio artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioCacheEntry {
    pub content_hash: String,
    pub file_path: PathBuf,
    pub duration_seconds: f64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Produced by background pre-generation rather than a listener
    pub is_pregenerated: bool,
}

impl AudioCacheEntry {
    fn new(content_hash: &str, file_path: PathBuf, size_bytes: u64, metadata: &EntryMetadata) -> Self {
        let now = Utc::now();
        Self {
            content_hash: content_hash.to_string(),
            file_path,
            duration_seconds: metadata.duration_seconds,
            size_bytes,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            is_pregenerated: metadata.is_pregenerated,
        }
    }

    /// Record access to this entry
    fn record_access(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Eviction order: least recently accessed first, oldest first on ties.
    fn eviction_key(&self) -> (DateTime<Utc>, DateTime<Utc>, &str) {
        (self.last_accessed_at, self.created_at, self.content_hash.as_str())
    }
}

/// Caller-supplied description of a new artifact
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryMetadata {
    pub duration_seconds: f64,
    pub is_pregenerated: bool,
}

/// Configuration for the audio cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum total size of cached files in bytes
    pub max_size_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
    pub current_size_bytes: u64,
    pub max_size_bytes: u64,
    /// Cache hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

/// Error type for cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cache entry not found: {0}")]
    NotFound(String),

    #[error("Entry of {size} bytes exceeds the cache budget of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

// ============================================================================
// Per-hash locking
// ============================================================================

/// Hands out one async mutex per key; idle keys are dropped lazily.
#[derive(Default)]
struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    locks.retain(|_, weak| weak.strong_count() > 0);
                    let mutex = Arc::new(Mutex::new(()));
                    locks.insert(key.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }
}

// ============================================================================
// Audio Cache
// ============================================================================

/// Audio cache with LRU eviction and statistics tracking
pub struct AudioCache {
    cache_dir: PathBuf,
    config: CacheConfig,
    current_size: AtomicU64,
    entries: RwLock<HashMap<String, AudioCacheEntry>>,
    /// Serializes writers of the same hash
    key_locks: KeyedLocks,
    /// Serializes sidecar writes so a stale snapshot never overwrites a newer one
    metadata_lock: Mutex<()>,
    /// Access stats changed since the last sidecar write
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl AudioCache {
    /// Open (or create) a cache directory and rebuild the index.
    pub async fn open(cache_dir: PathBuf, config: CacheConfig) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir).await?;

        let cache = Self {
            cache_dir,
            config,
            current_size: AtomicU64::new(0),
            entries: RwLock::new(HashMap::new()),
            key_locks: KeyedLocks::default(),
            metadata_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };

        cache.rebuild_index().await?;
        Ok(cache)
    }

    /// Open a cache with default configuration
    pub async fn with_defaults(cache_dir: PathBuf) -> CacheResult<Self> {
        Self::open(cache_dir, CacheConfig::default()).await
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn max_size(&self) -> u64 {
        self.config.max_size_bytes
    }

    fn file_path(&self, content_hash: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{content_hash}.{AUDIO_EXTENSION}"))
    }

    /// Check presence without touching access statistics
    pub async fn contains(&self, content_hash: &str) -> bool {
        self.entries.read().await.contains_key(content_hash)
    }

    /// Peek at an entry without touching access statistics
    pub async fn peek(&self, content_hash: &str) -> Option<AudioCacheEntry> {
        self.entries.read().await.get(content_hash).cloned()
    }

    /// Look up an entry, recording the access on a hit.
    ///
    /// Entries whose file disappeared are dropped and reported as a miss.
    pub async fn lookup(&self, content_hash: &str) -> Option<AudioCacheEntry> {
        let path = self.peek(content_hash).await.map(|e| e.file_path);
        let present = match &path {
            Some(path) => fs::try_exists(path).await.unwrap_or(false),
            None => false,
        };

        let mut entries = self.entries.write().await;
        match entries.get_mut(content_hash) {
            Some(entry) if present => {
                entry.record_access();
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.dirty.store(true, Ordering::Relaxed);
                return Some(entry.clone());
            }
            Some(_) if path.is_some() => {
                if let Some(entry) = entries.remove(content_hash) {
                    log::warn!("Cache file for {} vanished, dropping entry", content_hash);
                    self.current_size.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                    self.dirty.store(true, Ordering::Relaxed);
                }
            }
            _ => {}
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Read the audio file of an entry
    pub async fn read(&self, content_hash: &str) -> CacheResult<Vec<u8>> {
        let path = self
            .peek(content_hash)
            .await
            .map(|e| e.file_path)
            .ok_or_else(|| CacheError::NotFound(content_hash.to_string()))?;
        Ok(fs::read(path).await?)
    }

    /// Store an artifact, then evict least recently used entries until the
    /// cache fits its budget again. The new entry itself is never evicted.
    pub async fn put(
        &self,
        content_hash: &str,
        data: &[u8],
        metadata: EntryMetadata,
    ) -> CacheResult<AudioCacheEntry> {
        let size = data.len() as u64;
        if size > self.config.max_size_bytes {
            return Err(CacheError::TooLarge {
                size,
                max: self.config.max_size_bytes,
            });
        }

        let _guard = self.key_locks.lock(content_hash).await;

        let file_path = self.file_path(content_hash);
        write_atomic(&file_path, data).await?;

        let entry = AudioCacheEntry::new(content_hash, file_path, size, &metadata);
        let evicted = {
            let mut entries = self.entries.write().await;
            if let Some(old_entry) = entries.insert(content_hash.to_string(), entry.clone()) {
                self.current_size.fetch_sub(old_entry.size_bytes, Ordering::Relaxed);
            }
            self.current_size.fetch_add(size, Ordering::Relaxed);
            self.evict_over_budget(&mut entries, content_hash)
        };

        for victim in &evicted {
            if let Err(e) = fs::remove_file(&victim.file_path).await {
                log::warn!("Failed to delete evicted file {:?}: {}", victim.file_path, e);
            }
        }
        if !evicted.is_empty() {
            log::info!(
                "Evicted {} cache entries to fit {} bytes",
                evicted.len(),
                self.config.max_size_bytes
            );
        }

        self.persist_metadata().await?;
        Ok(entry)
    }

    /// Remove an entry and its file. Returns whether an entry existed.
    pub async fn invalidate(&self, content_hash: &str) -> CacheResult<bool> {
        let _guard = self.key_locks.lock(content_hash).await;

        let removed = self.entries.write().await.remove(content_hash);
        let Some(entry) = removed else {
            return Ok(false);
        };

        self.current_size.fetch_sub(entry.size_bytes, Ordering::Relaxed);
        match fs::remove_file(&entry.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.persist_metadata().await?;
        log::info!("Invalidated cached audio {}", content_hash);
        Ok(true)
    }

    /// Drop least recently accessed entries (never `protect`) until the total
    /// size fits the budget. Returns the removed entries for file cleanup.
    fn evict_over_budget(
        &self,
        entries: &mut HashMap<String, AudioCacheEntry>,
        protect: &str,
    ) -> Vec<AudioCacheEntry> {
        let max = self.config.max_size_bytes;
        if self.current_size.load(Ordering::Relaxed) <= max {
            return Vec::new();
        }

        let mut candidates: Vec<&AudioCacheEntry> = entries
            .values()
            .filter(|e| e.content_hash != protect)
            .collect();
        candidates.sort_by(|a, b| a.eviction_key().cmp(&b.eviction_key()));

        let mut projected = self.current_size.load(Ordering::Relaxed);
        let mut victims = Vec::new();
        for candidate in candidates {
            if projected <= max {
                break;
            }
            projected = projected.saturating_sub(candidate.size_bytes);
            victims.push(candidate.content_hash.clone());
        }

        victims
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .inspect(|entry| {
                self.current_size.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            })
            .collect()
    }

    /// Write access statistics gathered by lookups, if any changed.
    pub async fn flush(&self) -> CacheResult<()> {
        if self.dirty.load(Ordering::Relaxed) {
            self.persist_metadata().await?;
        }
        Ok(())
    }

    async fn persist_metadata(&self) -> CacheResult<()> {
        let _guard = self.metadata_lock.lock().await;
        let snapshot: Vec<AudioCacheEntry> = {
            let entries = self.entries.read().await;
            let mut list: Vec<_> = entries.values().cloned().collect();
            list.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
            list
        };
        self.dirty.store(false, Ordering::Relaxed);
        let json = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.cache_dir.join(METADATA_FILE), &json).await?;
        Ok(())
    }

    /// Rebuild the index from the sidecar and the files on disk
    async fn rebuild_index(&self) -> CacheResult<()> {
        let mut known: HashMap<String, AudioCacheEntry> =
            match fs::read(self.cache_dir.join(METADATA_FILE)).await {
                Ok(bytes) => match serde_json::from_slice::<Vec<AudioCacheEntry>>(&bytes) {
                    Ok(list) => list
                        .into_iter()
                        .map(|e| (e.content_hash.clone(), e))
                        .collect(),
                    Err(e) => {
                        log::warn!("Cache metadata unreadable, rebuilding from files: {}", e);
                        HashMap::new()
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(e) => return Err(e.into()),
            };

        let mut entries = self.entries.write().await;
        entries.clear();

        let mut total_size: u64 = 0;
        let mut adopted = 0usize;
        let mut read_dir = fs::read_dir(&self.cache_dir).await?;

        while let Some(dir_entry) = read_dir.next_entry().await? {
            let path = dir_entry.path();
            let file_name = dir_entry.file_name().to_string_lossy().into_owned();

            if file_name.ends_with(TEMP_SUFFIX) {
                log::debug!("Removing interrupted write {:?}", path);
                let _ = fs::remove_file(&path).await;
                continue;
            }

            if path.extension().and_then(|s| s.to_str()) != Some(AUDIO_EXTENSION) {
                continue;
            }
            let Some(content_hash) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };

            let Ok(metadata) = fs::metadata(&path).await else {
                continue;
            };
            let size = metadata.len();

            let entry = match known.remove(&content_hash) {
                Some(mut entry) => {
                    entry.file_path = path;
                    entry.size_bytes = size;
                    entry
                }
                None => {
                    adopted += 1;
                    let samples = size.saturating_sub(WAV_HEADER_BYTES) / 2;
                    let meta = EntryMetadata {
                        duration_seconds: codec::duration_secs(samples as usize),
                        is_pregenerated: false,
                    };
                    AudioCacheEntry::new(&content_hash, path, size, &meta)
                }
            };
            total_size += size;
            entries.insert(content_hash, entry);
        }

        if !known.is_empty() {
            log::warn!("Dropped {} cache entries whose files are missing", known.len());
        }
        if adopted > 0 {
            log::info!("Adopted {} cache files without metadata", adopted);
        }

        self.current_size.store(total_size, Ordering::Relaxed);
        log::info!(
            "Audio cache ready: {} entries, {} bytes in {:?}",
            entries.len(),
            total_size,
            self.cache_dir
        );
        Ok(())
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: entries.len(),
            current_size_bytes: self.current_size.load(Ordering::Relaxed),
            max_size_bytes: self.config.max_size_bytes,
            hit_rate: 0.0,
        };
        stats.calculate_hit_rate();
        stats
    }

    /// List all cache entries
    pub async fn list_entries(&self) -> Vec<AudioCacheEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
