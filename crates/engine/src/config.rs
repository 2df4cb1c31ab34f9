//! Engine configuration.
//!
//! Stored as JSON. Every field has a default, so partial files and files
//! written by older versions load cleanly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::upload::GraphPolicy;

pub const DEFAULT_MAX_BLOCK_SIZE: usize = nimbus_transfer::DEFAULT_BLOCK_SIZE;
pub const DEFAULT_PAGE_SIZE: u32 = 150;

fn default_max_block_size() -> usize {
    DEFAULT_MAX_BLOCK_SIZE
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_download_concurrency() -> usize {
    8
}

fn default_tree_scan_concurrency() -> usize {
    1
}

fn default_multi_root_scan_concurrency() -> usize {
    6
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("nimbus-cache")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cleartext bytes per block.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    /// Children requested per folder listing call.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Folder listings running at once while descending a single tree.
    #[serde(default = "default_tree_scan_concurrency")]
    pub tree_scan_concurrency: usize,

    /// Folder listings running at once when scanning several roots.
    #[serde(default = "default_multi_root_scan_concurrency")]
    pub multi_root_scan_concurrency: usize,

    /// List trashed and deleted children too.
    #[serde(default)]
    pub include_deleted: bool,

    #[serde(default)]
    pub graph_policy: GraphPolicy,

    /// Root of the encrypted block cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_block_size: default_max_block_size(),
            page_size: default_page_size(),
            upload_concurrency: default_upload_concurrency(),
            download_concurrency: default_download_concurrency(),
            tree_scan_concurrency: default_tree_scan_concurrency(),
            multi_root_scan_concurrency: default_multi_root_scan_concurrency(),
            include_deleted: false,
            graph_policy: GraphPolicy::default(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields defaults. A file that does not parse is
    /// logged and replaced by defaults.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {e}", path.display())))?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse engine config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Writes configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_block_size == 0 {
            return Err(SyncError::Config("max_block_size must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be positive".into()));
        }
        let limits = [
            ("upload_concurrency", self.upload_concurrency),
            ("download_concurrency", self.download_concurrency),
            ("tree_scan_concurrency", self.tree_scan_concurrency),
            ("multi_root_scan_concurrency", self.multi_root_scan_concurrency),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(SyncError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
