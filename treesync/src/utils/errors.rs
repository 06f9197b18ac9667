//! Error types for the sync engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid directory: {}", .0.display())]
    InvalidDirectory(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors raised before any filesystem mutation happened.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidDirectory(_) | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
