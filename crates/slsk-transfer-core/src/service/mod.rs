//! Collaborator traits consumed by the transfer manager and the workflow
//! facade it exposes.
//!
//! Collaborators are called from the manager's owner task. Implementations
//! must not block for long and must not call back into the manager
//! synchronously; results come back as [`crate::protocol::NetworkEvent`]s or
//! through the job completion path.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use slsk_events::{TransferDirection, TransferId, TransferSnapshot};

use crate::model::{ConnectionId, FileAttributes, RequestToken, TimerId};
use crate::protocol::PeerMessage;

/// Outbound half of the peer socket layer.
pub trait PeerNetwork: Send + Sync {
    /// Deliver a control message to `username`, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be queued for delivery.
    fn send_message(&self, username: &str, message: PeerMessage) -> anyhow::Result<()>;

    /// Open a file connection to `username` announcing `token`.
    ///
    /// The outcome is reported as `FileConnectionEstablished` or
    /// `PeerConnectFailed`.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection attempt cannot be started.
    fn open_file_connection(&self, username: &str, token: RequestToken) -> anyhow::Result<()>;

    /// Tell the uploader where to resume.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is gone.
    fn send_file_offset(&self, connection: ConnectionId, offset: u64) -> anyhow::Result<()>;

    /// Queue file bytes on an upload connection.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is gone.
    fn send_file_data(&self, connection: ConnectionId, data: Vec<u8>) -> anyhow::Result<()>;

    /// Close a file connection. A `ConnectionClosed` event may still follow.
    fn close_connection(&self, connection: ConnectionId);
}

/// Requests the manager makes to the central server client.
pub trait ServerClient: Send + Sync {
    /// Subscribe to online status changes of `username`.
    fn watch_user(&self, username: &str);

    /// Ask for the listening address of `username`.
    fn request_user_address(&self, username: &str);

    /// Report the speed of a finished upload in bytes per second.
    fn send_upload_speed(&self, speed: u64);
}

/// File found in the local shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    /// Path on disk.
    pub real_path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Indexed metadata.
    pub file_attributes: FileAttributes,
}

/// Read-only view of the local shares.
pub trait SharesIndex: Send + Sync {
    /// Look up `virtual_path` as visible to `username`.
    fn shared_file(&self, username: &str, virtual_path: &str) -> Option<SharedFile>;
}

/// Result of checking a peer against bans and address filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The peer may queue files.
    Allowed,
    /// The user is banned; the message is shown to them when present.
    Banned(Option<String>),
    /// The address is filtered (country or IP block).
    Blocked,
}

/// Ban and address filtering.
pub trait NetworkFilter: Send + Sync {
    /// Check whether `username` at `address` may queue uploads.
    fn check(&self, username: &str, address: Option<IpAddr>) -> Admission;

    /// Add `username` to the ban list.
    fn ban_user(&self, username: &str);
}

/// Timer callbacks delivered back to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The peer did not answer, or did not connect, in time.
    RequestTimeout {
        /// Transfer waiting on the peer.
        transfer_id: TransferId,
        /// Token outstanding when the timer was armed, if any.
        token: Option<RequestToken>,
    },
}

/// One-shot timers.
pub trait Scheduler: Send + Sync {
    /// Fire `event` no earlier than `delay` from now.
    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerId;

    /// Cancel a timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel(&self, timer: TimerId);
}

/// Move a completed download from the incomplete folder to its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeJob {
    /// Download being finished.
    pub transfer_id: TransferId,
    /// Fully written incomplete file.
    pub incomplete_path: PathBuf,
    /// Destination folder.
    pub folder_path: PathBuf,
    /// File name wanted in the destination folder.
    pub basename: String,
}

/// Completion of a [`FinalizeJob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The file landed at `final_path`.
    Moved {
        /// Final location, after conflict renaming.
        final_path: PathBuf,
    },
    /// The destination could not be prepared or written.
    Failed {
        /// Error text for logs.
        message: String,
    },
}

/// Runs blocking jobs off the owner task.
///
/// Completions are posted back to the owner as
/// `(FinalizeJob::transfer_id, FinalizeOutcome)`.
pub trait JobRunner: Send + Sync {
    /// Submit a finalize job.
    fn submit(&self, job: FinalizeJob);
}

/// User request to download a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Peer sharing the file.
    pub username: String,
    /// Path in the peer's shares.
    pub virtual_path: String,
    /// Destination folder; the configured download folder when absent.
    pub folder_path: Option<PathBuf>,
    /// Size from search results, when known.
    pub size: Option<u64>,
    /// Metadata from search results.
    pub file_attributes: FileAttributes,
}

impl DownloadRequest {
    /// Request with no size, attributes or explicit folder.
    #[must_use]
    pub fn new(username: impl Into<String>, virtual_path: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            virtual_path: virtual_path.into(),
            folder_path: None,
            size: None,
            file_attributes: FileAttributes::new(),
        }
    }
}

/// Outcome of queueing a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new transfer was created.
    Queued(TransferId),
    /// An identical download is already pending.
    AlreadyQueued(TransferId),
}

impl EnqueueOutcome {
    /// Identifier of the transfer handling the request.
    #[must_use]
    pub const fn transfer_id(self) -> TransferId {
        match self {
            Self::Queued(id) | Self::AlreadyQueued(id) => id,
        }
    }
}

/// Workflow facade exposed to the GUI for transfer lifecycle control.
#[async_trait]
pub trait TransferWorkflow: Send + Sync {
    /// Queue a download.
    async fn enqueue_download(&self, request: DownloadRequest) -> anyhow::Result<EnqueueOutcome>;

    /// Stop a transfer, optionally deleting the partial download.
    async fn abort(
        &self,
        direction: TransferDirection,
        id: TransferId,
        delete_partial: bool,
    ) -> anyhow::Result<()>;

    /// Remove a transfer from the list.
    async fn clear(&self, direction: TransferDirection, id: TransferId) -> anyhow::Result<()>;

    /// Pause a download; default implementation reports lack of support.
    async fn pause(&self, id: TransferId) -> anyhow::Result<()> {
        let _ = id;
        bail!("pause operation not supported");
    }

    /// Re-request a paused or failed download; default implementation reports
    /// lack of support.
    async fn retry(&self, id: TransferId) -> anyhow::Result<()> {
        let _ = id;
        bail!("retry operation not supported");
    }

    /// Remove every finished transfer in `direction`; default implementation
    /// reports lack of support.
    async fn clear_finished(&self, direction: TransferDirection) -> anyhow::Result<()> {
        let _ = direction;
        bail!("clear finished not supported");
    }

    /// Ban a user and drop their uploads; default implementation reports lack
    /// of support.
    async fn ban_user(&self, username: String) -> anyhow::Result<()> {
        let _ = username;
        bail!("ban operation not supported");
    }

    /// Replace the server-granted privileged user list; default implementation
    /// reports lack of support.
    async fn set_privileged_users(&self, usernames: Vec<String>) -> anyhow::Result<()> {
        let _ = usernames;
        bail!("privileged user updates not supported");
    }

    /// Snapshot every transfer in `direction`; default implementation reports
    /// lack of support.
    async fn list(&self, direction: TransferDirection) -> anyhow::Result<Vec<TransferSnapshot>> {
        let _ = direction;
        bail!("transfer listing not supported");
    }
}
