#![forbid(unsafe_code)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Network-agnostic transfer model, queue policy and negotiation rules.
//!
//! Nothing here performs IO. The manager in `slsk-transfers` owns the records
//! and talks to the collaborators declared in [`service`].

pub mod error;
pub mod model;
pub mod negotiation;
pub mod policy;
pub mod protocol;
pub mod service;

pub use error::{TransferError, TransferResult};
pub use model::{
    ConnectionId, Detached, FileAttribute, FileAttributes, ProgressSampler, RejectReason,
    RequestToken, TimerId, TokenAllocator, Transfer, virtual_basename,
};
pub use negotiation::{NegotiationEvent, next_status};
pub use policy::{PolicyContext, queue_position, select_candidate};
pub use protocol::{IncomingTransferRequest, IncomingTransferResponse, NetworkEvent, PeerMessage};
pub use service::{
    Admission, DownloadRequest, EnqueueOutcome, FinalizeJob, FinalizeOutcome, JobRunner,
    NetworkFilter, PeerNetwork, Scheduler, ServerClient, SharedFile, SharesIndex, TimerEvent,
    TransferWorkflow,
};
