use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{error::TsumugiResult, segment::SegmentTask};

/// Directory holding decrypted segments until they are merged.
pub struct SegmentCache {
    cache_dir: PathBuf,
    /// Whether the directory was created by us and may be removed afterwards
    created: bool,
}

impl SegmentCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            created: false,
        }
    }

    /// Fresh `tsumugi_<millis>` directory under `root`.
    pub fn default_dir(root: impl AsRef<Path>) -> PathBuf {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        root.as_ref().join(format!("tsumugi_{started_at}"))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub async fn ensure_cache_dir(&mut self) -> TsumugiResult<()> {
        if !self.cache_dir.exists() {
            tokio::fs::create_dir_all(&self.cache_dir).await?;
            self.created = true;
        }

        Ok(())
    }

    /// Unique path of a segment inside the cache directory.
    pub fn segment_path(&self, task: &SegmentTask) -> PathBuf {
        let filename = task.file_name().replace(['/', '\\'], "__");
        let index = task.index;
        self.cache_dir.join(format!("{index:06}_{filename}"))
    }

    pub async fn invalidate(&self, task: &SegmentTask) -> TsumugiResult<()> {
        let path = self.segment_path(task);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    /// Remove the cache directory if we created it and nothing is left inside.
    pub async fn cleanup(&self) -> TsumugiResult<()> {
        if !self.created {
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(&self.cache_dir).await?;
        if entries.next_entry().await?.is_none() {
            tokio::fs::remove_dir(&self.cache_dir).await?;
            tracing::debug!("Removed cache directory {}", self.cache_dir.display());
        }
        Ok(())
    }
}
