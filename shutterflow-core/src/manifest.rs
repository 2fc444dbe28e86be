use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name of the manifest artifact inside each batch directory.
pub const FILE_NAME: &str = "manifest.json";

/// Per-batch manifest written next to the staged files. It freezes what
/// the batch contained at creation time, independent of later catalog
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub batch: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub size_bytes: i64,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Where the file lived before staging.
    pub source_path: String,
    /// Where it sits inside the batch directory.
    pub batch_path: String,
    /// Path relative to the batch directory root.
    pub relative_path: String,
    pub size: i64,
    pub sha256: Option<String>,
}

impl Manifest {
    pub async fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}
