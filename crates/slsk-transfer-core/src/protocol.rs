//! Messages crossing the boundary between the engine and the network layer.
//!
//! These are message-level contracts only; framing and sockets belong to the
//! network layer.

use std::net::{IpAddr, SocketAddr};

use slsk_events::TransferDirection;

use crate::model::{ConnectionId, FileAttributes, RejectReason, RequestToken};

/// Messages the engine asks the network layer to deliver to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Ask the peer to send (`Download`) or offer to send (`Upload`) a file.
    TransferRequest {
        /// Direction from the sender's point of view.
        direction: TransferDirection,
        /// Correlation token.
        token: RequestToken,
        /// Requested path.
        virtual_path: String,
        /// Size, present when offering an upload.
        size: Option<u64>,
    },
    /// Answer to a transfer request.
    TransferResponse {
        /// Token of the request being answered.
        token: RequestToken,
        /// Whether the transfer may proceed.
        allowed: bool,
        /// Refusal reason when not allowed.
        reason: Option<RejectReason>,
        /// File size, when allowing a download request.
        size: Option<u64>,
    },
    /// Ask the peer to queue a file for us.
    QueueUpload {
        /// Requested path.
        virtual_path: String,
    },
    /// Ask where a file sits in the peer's upload queue.
    PlaceInQueueRequest {
        /// Requested path.
        virtual_path: String,
    },
    /// Tell the peer where its file sits in our queue.
    PlaceInQueueResponse {
        /// Requested path.
        virtual_path: String,
        /// One-based place.
        place: u32,
    },
    /// Refuse or cancel an upload the peer asked for.
    UploadDenied {
        /// Requested path.
        virtual_path: String,
        /// Reason.
        reason: RejectReason,
    },
    /// Tell the peer its upload from us failed.
    UploadFailed {
        /// Requested path.
        virtual_path: String,
    },
}

impl PeerMessage {
    /// Short label for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TransferRequest { .. } => "transfer_request",
            Self::TransferResponse { .. } => "transfer_response",
            Self::QueueUpload { .. } => "queue_upload",
            Self::PlaceInQueueRequest { .. } => "place_in_queue_request",
            Self::PlaceInQueueResponse { .. } => "place_in_queue_response",
            Self::UploadDenied { .. } => "upload_denied",
            Self::UploadFailed { .. } => "upload_failed",
        }
    }
}

/// Transfer request received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingTransferRequest {
    /// Sending peer.
    pub username: String,
    /// Peer address, when the connection is direct.
    pub address: Option<IpAddr>,
    /// `Download` asks us to upload; `Upload` offers us a file.
    pub direction: TransferDirection,
    /// Peer-allocated token.
    pub token: RequestToken,
    /// Requested or offered path.
    pub virtual_path: String,
    /// Size of an offered file.
    pub size: Option<u64>,
}

/// Response to one of our transfer requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingTransferResponse {
    /// Answering peer.
    pub username: String,
    /// Token of our request.
    pub token: RequestToken,
    /// Whether we may proceed.
    pub allowed: bool,
    /// Refusal reason.
    pub reason: Option<RejectReason>,
    /// File size reported when a download request is allowed.
    pub size: Option<u64>,
}

/// Everything the network layer and the server client report to the engine.
///
/// Events may be produced on any thread; they are applied one at a time on
/// the engine's owner task.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// The server reported a user's online state.
    UserStatusChanged {
        /// User.
        username: String,
        /// Online or not.
        online: bool,
    },
    /// The server resolved a user's address.
    PeerResolved {
        /// User.
        username: String,
        /// Listening address.
        address: SocketAddr,
    },
    /// Neither a direct nor a server-assisted connection reached the peer.
    PeerConnectFailed {
        /// User.
        username: String,
        /// Token of the transfer the connection was for.
        token: Option<RequestToken>,
    },
    /// A peer sent a transfer request.
    TransferRequest(IncomingTransferRequest),
    /// A peer answered one of our transfer requests.
    TransferResponse(IncomingTransferResponse),
    /// A peer asked us to queue a file.
    QueueUpload {
        /// Requesting peer.
        username: String,
        /// Peer address.
        address: Option<IpAddr>,
        /// Requested path.
        virtual_path: String,
        /// Metadata the peer already knows about the file.
        file_attributes: FileAttributes,
    },
    /// A peer asked for the place of a file in our queue.
    PlaceInQueueRequest {
        /// Requesting peer.
        username: String,
        /// Requested path.
        virtual_path: String,
    },
    /// A peer told us the place of our download in its queue.
    PlaceInQueueResponse {
        /// Uploading peer.
        username: String,
        /// Requested path.
        virtual_path: String,
        /// One-based place.
        place: u32,
    },
    /// A peer refused to queue one of our downloads.
    QueueFailed {
        /// Uploading peer.
        username: String,
        /// Requested path.
        virtual_path: String,
        /// Reason text, kept verbatim.
        reason: String,
    },
    /// A peer failed to send one of our downloads.
    UploadFailed {
        /// Uploading peer.
        username: String,
        /// Requested path.
        virtual_path: String,
    },
    /// A file connection identified by a transfer token is up.
    FileConnectionEstablished {
        /// Peer on the other end.
        username: String,
        /// Token sent in the connection's init message.
        token: RequestToken,
        /// Connection handle.
        connection: ConnectionId,
    },
    /// The downloader told us where to resume.
    FileOffset {
        /// File connection.
        connection: ConnectionId,
        /// Byte offset.
        offset: u64,
    },
    /// Payload bytes arrived on a download connection.
    BytesReceived {
        /// File connection.
        connection: ConnectionId,
        /// Chunk.
        chunk: Vec<u8>,
    },
    /// An upload connection can take more data.
    ReadyToSend {
        /// File connection.
        connection: ConnectionId,
        /// Upper bound of bytes to hand over.
        max_bytes: usize,
    },
    /// Bytes handed to an upload connection were written to the socket.
    BytesTransferred {
        /// File connection.
        connection: ConnectionId,
        /// Bytes written.
        byte_count: u64,
    },
    /// A file connection went away.
    ConnectionClosed {
        /// Connection handle.
        connection: ConnectionId,
    },
}

impl NetworkEvent {
    /// Short label for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UserStatusChanged { .. } => "user_status_changed",
            Self::PeerResolved { .. } => "peer_resolved",
            Self::PeerConnectFailed { .. } => "peer_connect_failed",
            Self::TransferRequest(_) => "transfer_request",
            Self::TransferResponse(_) => "transfer_response",
            Self::QueueUpload { .. } => "queue_upload",
            Self::PlaceInQueueRequest { .. } => "place_in_queue_request",
            Self::PlaceInQueueResponse { .. } => "place_in_queue_response",
            Self::QueueFailed { .. } => "queue_failed",
            Self::UploadFailed { .. } => "upload_failed",
            Self::FileConnectionEstablished { .. } => "file_connection_established",
            Self::FileOffset { .. } => "file_offset",
            Self::BytesReceived { .. } => "bytes_received",
            Self::ReadyToSend { .. } => "ready_to_send",
            Self::BytesTransferred { .. } => "bytes_transferred",
            Self::ConnectionClosed { .. } => "connection_closed",
        }
    }
}
