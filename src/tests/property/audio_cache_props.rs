//! Property-based tests for the audio cache
//!
//! Tests invariants:
//! - Total size never exceeds the configured budget
//! - Tracked size matches the entries present
//! - Eviction takes the least recently accessed entries first

use std::collections::HashSet;

use proptest::prelude::*;
use tempfile::TempDir;

use crate::core::voice::cache::{AudioCache, AudioCacheEntry, CacheConfig, EntryMetadata};

const MAX_SIZE: u64 = 1_000;

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Clone)]
enum CacheOp {
    Put { key: u8, size: usize },
    Lookup { key: u8 },
}

fn arb_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => (0u8..8, 1usize..=400).prop_map(|(key, size)| CacheOp::Put { key, size }),
        1 => (0u8..8).prop_map(|key| CacheOp::Lookup { key }),
    ]
}

fn key_name(key: u8) -> String {
    format!("entry{key:02}")
}

fn metadata() -> EntryMetadata {
    EntryMetadata {
        duration_seconds: 1.0,
        is_pregenerated: false,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Entries in the order the cache should evict them.
fn eviction_order(mut entries: Vec<AudioCacheEntry>) -> Vec<AudioCacheEntry> {
    entries.sort_by(|a, b| {
        (a.last_accessed_at, a.created_at, &a.content_hash)
            .cmp(&(b.last_accessed_at, b.created_at, &b.content_hash))
    });
    entries
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: any sequence of puts keeps the total within the budget
    #[test]
    fn prop_size_stays_within_budget(ops in prop::collection::vec(arb_op(), 1..40)) {
        let dir = TempDir::new().unwrap();
        runtime().block_on(async {
            let cache = AudioCache::open(
                dir.path().to_path_buf(),
                CacheConfig { max_size_bytes: MAX_SIZE },
            )
            .await
            .unwrap();

            for op in ops {
                match op {
                    CacheOp::Put { key, size } => {
                        cache.put(&key_name(key), &vec![0u8; size], metadata()).await.unwrap();
                    }
                    CacheOp::Lookup { key } => {
                        cache.lookup(&key_name(key)).await;
                    }
                }

                let entries = cache.list_entries().await;
                let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
                prop_assert!(cache.current_size() <= MAX_SIZE);
                prop_assert_eq!(total, cache.current_size());
                for entry in &entries {
                    prop_assert!(entry.file_path.exists(), "missing file for {}", entry.content_hash);
                }
            }
            Ok(())
        })?;
    }

    /// Property: a put only evicts a prefix of the LRU order
    #[test]
    fn prop_evicts_least_recently_accessed_first(ops in prop::collection::vec(arb_op(), 1..40)) {
        let dir = TempDir::new().unwrap();
        runtime().block_on(async {
            let cache = AudioCache::open(
                dir.path().to_path_buf(),
                CacheConfig { max_size_bytes: MAX_SIZE },
            )
            .await
            .unwrap();

            for op in ops {
                let (key, size) = match op {
                    CacheOp::Put { key, size } => (key, size),
                    CacheOp::Lookup { key } => {
                        cache.lookup(&key_name(key)).await;
                        continue;
                    }
                };
                let name = key_name(key);

                let before: Vec<AudioCacheEntry> = eviction_order(cache.list_entries().await)
                    .into_iter()
                    .filter(|e| e.content_hash != name)
                    .collect();
                cache.put(&name, &vec![0u8; size], metadata()).await.unwrap();
                let after: HashSet<String> = cache
                    .list_entries()
                    .await
                    .into_iter()
                    .map(|e| e.content_hash)
                    .collect();

                prop_assert!(after.contains(&name));
                let evicted: Vec<bool> = before
                    .iter()
                    .map(|e| !after.contains(&e.content_hash))
                    .collect();
                // evicted entries form a prefix of the LRU order
                let survivors_start = evicted.iter().position(|gone| !gone).unwrap_or(evicted.len());
                prop_assert!(
                    evicted[survivors_start..].iter().all(|gone| !gone),
                    "eviction skipped an older entry: {:?}",
                    evicted
                );
            }
            Ok(())
        })?;
    }
}
