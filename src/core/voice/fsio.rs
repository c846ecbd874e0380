//! Crash-safe file writes.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Suffix of in-flight temporary files; leftovers are swept on startup.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Writes `data` to `path` through a sibling temporary file and a rename, so
/// readers observe either the old content or the complete new content.
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_path = temp_path_for(path);

    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple()))
}
