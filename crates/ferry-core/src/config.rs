//! Engine configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::FileOpError;

/// Default size of the buffer used when copying file contents.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Default cap on duplicate-name attempts when renaming on conflict.
pub const DEFAULT_DUPLICATE_NAME_LIMIT: u32 = 65_536;

/// Configuration shared by every job launched from a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the read/write buffer for file copies, and the granularity of
    /// byte progress reports.
    #[builder(default = "DEFAULT_COPY_BUFFER_SIZE")]
    pub copy_buffer_size: usize,

    /// Descend into existing destination directories instead of treating
    /// them as conflicts.
    #[builder(default = "true")]
    pub merge_directories: bool,

    /// Copy permission bits to the destination.
    #[builder(default = "true")]
    pub preserve_permissions: bool,

    /// Copy modification times to the destination.
    #[builder(default = "true")]
    pub preserve_timestamps: bool,

    /// Copy what symbolic links point to instead of the links themselves.
    #[builder(default = "false")]
    pub follow_symlinks: bool,

    /// Maximum number of duplicate-name candidates tried before giving up.
    #[builder(default = "DEFAULT_DUPLICATE_NAME_LIMIT")]
    pub duplicate_name_limit: u32,

    /// Minimum interval between mid-file progress reports.
    #[builder(default = "100")]
    pub progress_interval_ms: u64,

    /// Number of entries a listdir job emits per batch.
    #[builder(default = "64")]
    pub listdir_batch_size: usize,

    /// Refuse to start a copy whose total size exceeds the free space of
    /// the destination volume.
    #[builder(default = "true")]
    pub check_free_space: bool,
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.copy_buffer_size == Some(0) {
            return Err("Copy buffer size must be positive".to_string());
        }
        if self.duplicate_name_limit == Some(0) {
            return Err("Duplicate name limit must be positive".to_string());
        }
        if self.listdir_batch_size == Some(0) {
            return Err("Listdir batch size must be positive".to_string());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new engine config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FileOpError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| FileOpError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            FileOpError::invalid(format!("{}: {e}", path.display()))
        })?;
        config.check()?;
        Ok(config)
    }

    /// Where a host looks for its config when none is given:
    /// `<config dir>/ferry/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ferry").join("config.json"))
    }

    /// Validate a config that was built without the builder.
    pub fn check(&self) -> Result<(), FileOpError> {
        if self.copy_buffer_size == 0 {
            return Err(FileOpError::invalid("copy_buffer_size must be positive"));
        }
        if self.duplicate_name_limit == 0 {
            return Err(FileOpError::invalid("duplicate_name_limit must be positive"));
        }
        if self.listdir_batch_size == 0 {
            return Err(FileOpError::invalid("listdir_batch_size must be positive"));
        }
        Ok(())
    }

    /// Minimum interval between mid-file progress reports.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            merge_directories: true,
            preserve_permissions: true,
            preserve_timestamps: true,
            follow_symlinks: false,
            duplicate_name_limit: DEFAULT_DUPLICATE_NAME_LIMIT,
            progress_interval_ms: 100,
            listdir_batch_size: 64,
            check_free_space: true,
        }
    }
}

/// Options for the host filesystem implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFsOptions {
    /// Trash directory used instead of the platform trash.
    #[serde(default)]
    pub trash_dir: Option<PathBuf>,
}
