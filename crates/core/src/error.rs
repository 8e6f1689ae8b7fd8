//! Error types for the block construction pipeline.
//!
//! Only unrecoverable conditions live here. Per-item rejections (a skipped
//! message, a discarded block) are plain enums in their own modules because
//! they are tallied, not propagated.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unrecognised export structure in {path:?}")]
    UnrecognisedExport { path: PathBuf },

    #[error("Export {path:?} contained no valid chat objects")]
    EmptyExport { path: PathBuf },

    #[error("No JSON exports found under {0:?}")]
    NoExports(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for override '{key}': {reason}")]
    InvalidOverride { key: String, reason: String },

    #[error("Upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
