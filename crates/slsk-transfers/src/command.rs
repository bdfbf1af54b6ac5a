//! Messages accepted by the transfer worker.

use anyhow::Result;
use slsk_events::{TransferDirection, TransferId, TransferSnapshot};
use slsk_transfer_core::{DownloadRequest, EnqueueOutcome, FinalizeOutcome, NetworkEvent, TimerEvent};
use tokio::sync::oneshot;

/// Reply channel for commands that report an outcome.
pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub(crate) enum TransferCommand {
    Enqueue {
        request: DownloadRequest,
        reply: Responder<EnqueueOutcome>,
    },
    Abort {
        direction: TransferDirection,
        id: TransferId,
        delete_partial: bool,
        reply: Responder<()>,
    },
    Clear {
        direction: TransferDirection,
        id: TransferId,
        reply: Responder<()>,
    },
    ClearFinished {
        direction: TransferDirection,
        reply: Responder<()>,
    },
    Pause {
        id: TransferId,
        reply: Responder<()>,
    },
    Retry {
        id: TransferId,
        reply: Responder<()>,
    },
    BanUser {
        username: String,
        reply: Responder<()>,
    },
    SetPrivileged {
        usernames: Vec<String>,
        reply: Responder<()>,
    },
    List {
        direction: TransferDirection,
        reply: Responder<Vec<TransferSnapshot>>,
    },
    Save {
        reply: Responder<()>,
    },
    Network(NetworkEvent),
    Timer(TimerEvent),
    JobFinished {
        transfer_id: TransferId,
        outcome: FinalizeOutcome,
    },
}
