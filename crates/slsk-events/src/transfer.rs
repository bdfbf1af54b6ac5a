//! Transfer vocabulary shared by the engine and every observer.
//!
//! Status strings double as the persisted representation and as the reason
//! text sent to peers, so [`TransferStatus::as_str`] must stay stable.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifier assigned to a transfer when it enters the manager.
///
/// Identifiers increase monotonically, which makes them usable as the
/// insertion-order tie breaker for queue fairness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl Display for TransferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the transfer the local client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// A peer sends a file to us.
    Download,
    /// We send a file to a peer.
    Upload,
}

impl TransferDirection {
    /// Label used for metrics and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }

    /// Numeric direction code carried by peer transfer requests.
    #[must_use]
    pub const fn wire_code(self) -> u32 {
        match self {
            Self::Download => 0,
            Self::Upload => 1,
        }
    }

    /// Decode a direction code received from a peer.
    #[must_use]
    pub const fn from_wire_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Download),
            1 => Some(Self::Upload),
            _ => None,
        }
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum TransferStatus {
    /// Waiting locally (uploads) or remotely (downloads) for a slot.
    Queued,
    /// Asking the central server whether the peer is online.
    GettingStatus,
    /// Asking the central server for the peer's address.
    GettingAddress,
    /// Opening the control connection to the peer.
    Connecting,
    /// Waiting for the peer to open the file connection.
    WaitingForConnection,
    /// A transfer request is outstanding and its response timer is running.
    Requesting,
    /// Request accepted; file connection being set up.
    Negotiating,
    /// Bytes are flowing.
    Transferring,
    /// Stopped by the user, resumable.
    Paused,
    /// Completed successfully. Terminal.
    Finished,
    /// Stopped by the user or by a ban.
    Aborted,
    /// Download skipped because it matched a download filter.
    Filtered,
    /// The peer could not be reached or never answered a request.
    CannotConnect,
    /// The connection dropped while the peer stayed online.
    ConnectionClosed,
    /// The peer went offline.
    UserLoggedOff,
    /// Reading or writing the local file failed.
    LocalFileError,
    /// The destination directory could not be created.
    DownloadFolderError,
    /// The requested path is not shared.
    FileNotShared,
    /// The per-user queue quota was exceeded.
    QueueLimitExceeded,
    /// The uploading peer failed to read its file.
    RemoteFileError,
    /// Opaque reason supplied by a peer or the server, kept verbatim.
    Rejected(String),
}

impl TransferStatus {
    /// Stable display string, also used on disk and on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "Queued",
            Self::GettingStatus => "Getting status",
            Self::GettingAddress => "Getting address",
            Self::Connecting => "Establishing connection",
            Self::WaitingForConnection => "Waiting for peer to connect",
            Self::Requesting => "Requesting file",
            Self::Negotiating => "Initializing transfer",
            Self::Transferring => "Transferring",
            Self::Paused => "Paused",
            Self::Finished => "Finished",
            Self::Aborted => "Aborted",
            Self::Filtered => "Filtered",
            Self::CannotConnect => "Cannot connect",
            Self::ConnectionClosed => "Connection closed",
            Self::UserLoggedOff => "User logged off",
            Self::LocalFileError => "Local file error",
            Self::DownloadFolderError => "Download folder error",
            Self::FileNotShared => "File not shared.",
            Self::QueueLimitExceeded => "Too many megabytes",
            Self::RemoteFileError => "Remote file error",
            Self::Rejected(reason) => reason,
        }
    }

    /// Parse a status string, accepting older spellings.
    ///
    /// Unknown strings are preserved verbatim as [`TransferStatus::Rejected`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "Queued" => Self::Queued,
            "Getting status" => Self::GettingStatus,
            "Getting address" => Self::GettingAddress,
            "Establishing connection" | "Connecting" => Self::Connecting,
            "Waiting for peer to connect" => Self::WaitingForConnection,
            "Requesting file" => Self::Requesting,
            "Initializing transfer" | "Negotiating" => Self::Negotiating,
            "Transferring" => Self::Transferring,
            "Paused" => Self::Paused,
            "Finished" => Self::Finished,
            "Aborted" => Self::Aborted,
            "Filtered" => Self::Filtered,
            "Cannot connect" => Self::CannotConnect,
            "Connection closed" | "Connection closed by peer" => Self::ConnectionClosed,
            "User logged off" => Self::UserLoggedOff,
            "Local file error" => Self::LocalFileError,
            "Download folder error" => Self::DownloadFolderError,
            "File not shared." | "File not shared" => Self::FileNotShared,
            "Too many megabytes" => Self::QueueLimitExceeded,
            "Remote file error" => Self::RemoteFileError,
            other => Self::Rejected(other.to_string()),
        }
    }

    /// Negotiating or moving bytes; the user occupies a slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::GettingStatus
                | Self::GettingAddress
                | Self::Connecting
                | Self::WaitingForConnection
                | Self::Requesting
                | Self::Negotiating
                | Self::Transferring
        )
    }

    /// Active but not yet moving bytes.
    #[must_use]
    pub const fn is_negotiating(&self) -> bool {
        self.is_active() && !matches!(self, Self::Transferring)
    }

    /// Network failures a download recovers from by re-requesting the file.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CannotConnect | Self::ConnectionClosed | Self::RemoteFileError
        )
    }

    /// Failures that need an explicit user action before anything happens again.
    #[must_use]
    pub const fn is_local_failure(&self) -> bool {
        matches!(
            self,
            Self::LocalFileError
                | Self::DownloadFolderError
                | Self::FileNotShared
                | Self::QueueLimitExceeded
        )
    }

    /// Not active, not queued and not waiting for an automatic retry.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !self.is_active() && !matches!(self, Self::Queued) && !self.is_retryable()
    }
}

impl Display for TransferStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TransferStatus> for String {
    fn from(status: TransferStatus) -> Self {
        status.as_str().to_string()
    }
}

impl From<String> for TransferStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

/// Read-only view of a transfer handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    /// Manager-assigned identifier.
    pub id: TransferId,
    /// Upload or download.
    pub direction: TransferDirection,
    /// Remote peer.
    pub username: String,
    /// Network-visible path of the file.
    pub virtual_path: String,
    /// Local destination (downloads) or source (uploads) folder.
    pub folder_path: String,
    /// Current lifecycle state.
    pub status: TransferStatus,
    /// File size in bytes, zero until known.
    pub size: u64,
    /// Bytes transferred so far, `None` before the transfer started.
    pub current_byte_offset: Option<u64>,
    /// Bytes per second, `None` until a measurement exists.
    pub speed: Option<f64>,
    /// Seconds remaining, `None` while the speed is unknown.
    pub eta_secs: Option<u64>,
    /// Position reported by the uploading peer for queued downloads.
    pub queue_position: Option<u32>,
    /// Peer-supplied file metadata keyed by attribute code.
    pub file_attributes: BTreeMap<u32, u32>,
}
