//! Error types for transfer operations.

use std::io;
use std::path::{Path, PathBuf};

use slsk_events::{TransferId, TransferStatus};
use thiserror::Error;

use crate::model::RejectReason;

/// Primary error type for transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No transfer with this identifier exists.
    #[error("transfer not found")]
    NotFound {
        /// Missing identifier.
        transfer_id: TransferId,
    },
    /// The same file from the same user is already queued or active.
    #[error("transfer already queued")]
    AlreadyQueued {
        /// Existing transfer.
        transfer_id: TransferId,
    },
    /// An event arrived that does not apply to the current status.
    #[error("invalid transfer state transition")]
    InvalidTransition {
        /// Transfer receiving the event.
        transfer_id: TransferId,
        /// Status at the time.
        from: TransferStatus,
        /// Event label.
        event: &'static str,
    },
    /// An upload request was refused at admission.
    #[error("transfer request rejected")]
    Rejected {
        /// Reason sent to the peer.
        reason: RejectReason,
    },
    /// Local filesystem failure.
    #[error("transfer io failure")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
}

impl TransferError {
    /// Wrap an IO error with its operation and path.
    #[must_use]
    pub fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Convenience alias for transfer results.
pub type TransferResult<T> = Result<T, TransferError>;
