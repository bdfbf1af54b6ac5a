//! Transfer records and the value types they carry.

mod attributes;
mod progress;
mod reason;
mod token;

pub use attributes::{FileAttribute, FileAttributes};
pub use progress::ProgressSampler;
pub use reason::RejectReason;
pub use token::{ConnectionId, RequestToken, TimerId, TokenAllocator};

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use slsk_events::{TransferDirection, TransferId, TransferSnapshot, TransferStatus};

use crate::error::{TransferError, TransferResult};
use crate::negotiation::{NegotiationEvent, next_status};

/// One file moving between us and a peer.
///
/// Status only changes through [`Transfer::apply`], which enforces the
/// negotiation rules; everything else is plain data owned by the manager.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Manager-assigned identifier, increasing with insertion order.
    pub id: TransferId,
    /// Upload or download.
    pub direction: TransferDirection,
    /// Remote peer.
    pub username: String,
    /// Network-visible path.
    pub virtual_path: String,
    /// Destination folder (downloads) or source folder (uploads).
    pub folder_path: PathBuf,
    /// Size in bytes, zero until known.
    pub size: u64,
    /// Bytes moved so far; `None` before the first byte.
    pub current_byte_offset: Option<u64>,
    /// Peer-supplied metadata.
    pub file_attributes: FileAttributes,
    /// Outstanding request token.
    pub request_token: Option<RequestToken>,
    /// Live file connection.
    pub connection: Option<ConnectionId>,
    /// Pending response timer.
    pub timer: Option<TimerId>,
    /// When the transfer entered the queue.
    pub queued_at: DateTime<Utc>,
    /// Position reported by the uploader for queued downloads.
    pub queue_position: Option<u32>,
    /// Incomplete file (downloads) or shared file (uploads) on disk.
    pub local_path: Option<PathBuf>,
    status: TransferStatus,
    progress: ProgressSampler,
}

/// Resources released when a transfer stops talking to its peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Detached {
    /// Token that was outstanding.
    pub token: Option<RequestToken>,
    /// Connection that was live.
    pub connection: Option<ConnectionId>,
    /// Timer that was pending.
    pub timer: Option<TimerId>,
}

impl Transfer {
    /// New queued transfer.
    #[must_use]
    pub fn new(
        id: TransferId,
        direction: TransferDirection,
        username: impl Into<String>,
        virtual_path: impl Into<String>,
        folder_path: impl Into<PathBuf>,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            direction,
            username: username.into(),
            virtual_path: virtual_path.into(),
            folder_path: folder_path.into(),
            size: 0,
            current_byte_offset: None,
            file_attributes: FileAttributes::new(),
            request_token: None,
            connection: None,
            timer: None,
            queued_at,
            queue_position: None,
            local_path: None,
            status: TransferStatus::Queued,
            progress: ProgressSampler::default(),
        }
    }

    /// Override the starting status, for records restored from disk.
    #[must_use]
    pub fn with_status(mut self, status: TransferStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the known size.
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Set the byte offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: Option<u64>) -> Self {
        self.current_byte_offset = offset;
        self
    }

    /// Set the file attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: FileAttributes) -> Self {
        self.file_attributes = attributes;
        self
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> &TransferStatus {
        &self.status
    }

    /// Feed a negotiation event.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidTransition`] when the event does not
    /// apply to the current status, or when an upload would finish before
    /// every byte of a non-empty file was sent. The status is left unchanged.
    pub fn apply(&mut self, event: &NegotiationEvent) -> TransferResult<&TransferStatus> {
        let invalid = || TransferError::InvalidTransition {
            transfer_id: self.id,
            from: self.status.clone(),
            event: event.name(),
        };

        if *event == NegotiationEvent::Completed
            && self.direction == TransferDirection::Upload
            && (self.size == 0 || self.current_byte_offset != Some(self.size))
        {
            return Err(invalid());
        }

        let next = next_status(&self.status, event).ok_or_else(invalid)?;
        if !next.is_active() {
            self.progress.reset();
        }
        self.status = next;
        Ok(&self.status)
    }

    /// Take the token, connection and timer, leaving the transfer detached.
    pub const fn detach(&mut self) -> Detached {
        Detached {
            token: self.request_token.take(),
            connection: self.connection.take(),
            timer: self.timer.take(),
        }
    }

    /// Start measuring progress from `offset`.
    pub fn begin_progress(&mut self, offset: u64, now: Instant) {
        self.current_byte_offset = Some(offset);
        self.progress.start(offset, now);
    }

    /// Record a new byte offset.
    ///
    /// Returns `false` and leaves the offset untouched when it would move
    /// backwards while transferring.
    pub fn record_progress(&mut self, offset: u64, now: Instant) -> bool {
        if self.status == TransferStatus::Transferring
            && self.current_byte_offset.is_some_and(|current| offset < current)
        {
            return false;
        }
        self.current_byte_offset = Some(offset);
        self.progress.sample(offset, now);
        true
    }

    /// Latest speed in bytes per second.
    #[must_use]
    pub const fn speed(&self) -> Option<f64> {
        self.progress.speed()
    }

    /// Seconds left at the latest speed.
    #[must_use]
    pub fn eta_secs(&self) -> Option<u64> {
        self.progress
            .eta(self.size, self.current_byte_offset.unwrap_or(0))
            .map(|eta| eta.as_secs())
    }

    /// Whether all bytes have arrived or been sent.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.current_byte_offset
            .is_some_and(|offset| offset >= self.size)
    }

    /// Basename of the virtual path, split on either separator.
    #[must_use]
    pub fn basename(&self) -> &str {
        virtual_basename(&self.virtual_path)
    }

    /// Whether this record refers to the given file.
    #[must_use]
    pub fn matches(&self, username: &str, virtual_path: &str) -> bool {
        self.username == username && self.virtual_path == virtual_path
    }

    /// Local file path, when resolved.
    #[must_use]
    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    /// Read-only copy for observers.
    #[must_use]
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            direction: self.direction,
            username: self.username.clone(),
            virtual_path: self.virtual_path.clone(),
            folder_path: self.folder_path.display().to_string(),
            status: self.status.clone(),
            size: self.size,
            current_byte_offset: self.current_byte_offset,
            speed: self.speed(),
            eta_secs: self.eta_secs(),
            queue_position: self.queue_position,
            file_attributes: self.file_attributes.as_map().clone(),
        }
    }
}

/// Last component of a network path; peers use `\` but `/` shows up too.
#[must_use]
pub fn virtual_basename(virtual_path: &str) -> &str {
    virtual_path
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(virtual_path)
}
