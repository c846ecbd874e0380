//! Durable task registry.
//!
//! A JSON object mapping task id to task record, rewritten through a temp
//! file and rename after every state change.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use tokio::fs;
use tokio::sync::Mutex;

use crate::core::voice::fsio::write_atomic;
use crate::core::voice::types::{GenerationTask, Result};

pub struct TaskRegistry {
    path: Option<PathBuf>,
    retention: usize,
    write_lock: Mutex<()>,
}

impl TaskRegistry {
    /// A registry without a path keeps everything in memory.
    pub fn new(path: Option<PathBuf>, retention: usize) -> Self {
        Self {
            path,
            retention,
            write_lock: Mutex::new(()),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub async fn load(&self) -> Result<Vec<GenerationTask>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };

        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let map: BTreeMap<String, GenerationTask> = serde_json::from_slice(&bytes)?;
        let mut tasks: Vec<GenerationTask> = map.into_values().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    /// Write a snapshot. Callers take the snapshot while holding
    /// `lock_for_write` so an older snapshot never lands after a newer one.
    pub async fn save(&self, tasks: &HashMap<String, GenerationTask>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let ordered: BTreeMap<&String, &GenerationTask> = tasks.iter().collect();
        let json = serde_json::to_vec_pretty(&ordered)?;
        write_atomic(path, &json).await?;
        Ok(())
    }

    pub async fn lock_for_write(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Drop the oldest terminal tasks beyond the retention limit. Returns the
    /// number removed.
    pub fn prune(&self, tasks: &mut HashMap<String, GenerationTask>) -> usize {
        let mut terminal: Vec<(chrono::DateTime<chrono::Utc>, String)> = tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.completed_at.unwrap_or(t.created_at), t.task_id.clone()))
            .collect();

        if terminal.len() <= self.retention {
            return 0;
        }

        terminal.sort();
        let excess = terminal.len() - self.retention;
        for (_, task_id) in terminal.into_iter().take(excess) {
            tasks.remove(&task_id);
        }
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::voice::types::{PreparedRequest, TaskPriority, TaskStatus};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn task(hash: &str, status: TaskStatus) -> GenerationTask {
        let mut task = GenerationTask::new(&PreparedRequest {
            text: "text".into(),
            voice: "A".into(),
            language: "en".into(),
            content_hash: hash.into(),
            priority: TaskPriority::Normal,
            pregenerate: false,
        });
        task.status = status;
        task
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let registry = TaskRegistry::new(Some(dir.path().join("nested").join("tasks.json")), 10);

        let mut tasks = HashMap::new();
        let t = task("h1", TaskStatus::Completed);
        tasks.insert(t.task_id.clone(), t.clone());
        registry.save(&tasks).await.unwrap();

        let loaded = registry.load().await.unwrap();
        assert_eq!(loaded, vec![t]);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = TaskRegistry::new(Some(dir.path().join("tasks.json")), 10);
        assert!(registry.load().await.unwrap().is_empty());

        let in_memory = TaskRegistry::new(None, 10);
        assert!(in_memory.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupt_file_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, b"{not json").unwrap();
        let registry = TaskRegistry::new(Some(path), 10);
        assert!(registry.load().await.is_err());
    }

    #[test]
    fn test_prune_keeps_active_and_newest_terminal() {
        let registry = TaskRegistry::new(None, 2);
        let mut tasks = HashMap::new();
        let now = Utc::now();

        for (i, status) in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Skipped]
            .into_iter()
            .enumerate()
        {
            let mut t = task(&format!("t{i}"), status);
            t.completed_at = Some(now + Duration::seconds(i as i64));
            tasks.insert(t.task_id.clone(), t);
        }
        let pending = task("p", TaskStatus::Pending);
        tasks.insert(pending.task_id.clone(), pending.clone());

        assert_eq!(registry.prune(&mut tasks), 1);
        assert_eq!(tasks.len(), 3);
        assert!(tasks.contains_key(&pending.task_id));
        assert!(!tasks.values().any(|t| t.content_hash == "t0"));
    }
}
