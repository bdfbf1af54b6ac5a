//! # Design
//!
//! - Constant messages; context lives in fields.
//! - Source errors are preserved, never interpolated.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type for transfer list persistence.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while loading or saving a transfer list.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("transfer store io failure")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The file is not JSON, or a row could not be encoded.
    #[error("transfer store json failure")]
    Json {
        /// Operation that failed.
        operation: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// The document is JSON but not a list of rows.
    #[error("transfer store record invalid")]
    InvalidRecord {
        /// File involved.
        path: PathBuf,
        /// Index of the offending row, when the document itself is valid.
        index: Option<usize>,
        /// What was wrong.
        reason: &'static str,
    },
}

impl StoreError {
    pub(crate) fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(operation: &'static str, path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn invalid(path: &Path, index: Option<usize>, reason: &'static str) -> Self {
        Self::InvalidRecord {
            path: path.to_path_buf(),
            index,
            reason,
        }
    }
}
