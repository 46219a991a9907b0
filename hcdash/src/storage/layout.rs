//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::file::File;

/// Where the control plane keeps its files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Settings file used when no `--config` is given
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Deployment history (JSON lines)
    pub fn history_file(&self) -> File {
        File::new(self.base_dir.join("deployments.jsonl"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        let base_dir = std::env::var("HCDASH_HOME").unwrap_or_else(|_| "data".to_string());
        Self::new(base_dir)
    }
}
