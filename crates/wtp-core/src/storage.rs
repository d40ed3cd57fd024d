//! Output directory for completed transfers.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use wtp_abstract::interface::file_name;

#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    /// Use `root`, creating it and any missing parents.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create output directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, index: u32) -> PathBuf {
        self.root.join(file_name(index))
    }

    /// Write transfer `index` as `FILE-<index>.out`.
    pub fn write_file(&self, index: u32, data: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(index);
        fs::write(&path, data).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), bytes = data.len(), "transfer stored");
        Ok(path)
    }
}
