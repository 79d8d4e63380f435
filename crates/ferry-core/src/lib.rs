//! Core types and traits for ferry.
//!
//! This crate provides the pieces shared by the job engine and its hosts:
//! the error taxonomy, the engine configuration, and the [`FileSystem`]
//! capability together with its local-disk implementation.

mod config;
mod error;
mod fs;
mod local;

pub use config::{
    DEFAULT_COPY_BUFFER_SIZE, DEFAULT_DUPLICATE_NAME_LIMIT, EngineConfig, EngineConfigBuilder,
    LocalFsOptions,
};
pub use error::{FileOpError, Result};
pub use fs::{DirEntries, DirEntry, EntryKind, FileStat, FileSystem, InodeInfo};
pub use local::LocalFs;
