#![forbid(unsafe_code)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Transfer manager, persistence and the async service that owns them.
//!
//! # Design
//! - A single worker task owns the [`TransferManager`]; everything else talks
//!   to it through [`TransferService`] (user operations) and
//!   [`NetworkEventSink`] (network and server callbacks).
//! - Timers and finalize jobs run as tokio tasks and post their completions
//!   back to the worker.

mod command;
pub mod error;
pub mod manager;
pub mod paths;
pub mod scheduler;
pub mod store;
pub mod table;
mod worker;

pub use error::{StoreError, StoreResult};
pub use manager::{Collaborators, TransferManager};
pub use scheduler::{BlockingJobRunner, TokioScheduler};
pub use store::{StoredTransfer, TransferStore};
pub use table::{Tally, TransferTable, UserCounters};

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use slsk_config::TransferConfig;
use slsk_events::{EventBus, TransferDirection, TransferId, TransferSnapshot};
use slsk_telemetry::Metrics;
use slsk_transfer_core::{
    DownloadRequest, EnqueueOutcome, NetworkEvent, NetworkFilter, PeerNetwork, ServerClient,
    SharesIndex, TransferWorkflow,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use command::{Responder, TransferCommand};

const COMMAND_BUFFER: usize = 128;

/// Collaborators supplied by the host application.
#[derive(Clone)]
pub struct PeerServices {
    /// Peer socket layer.
    pub network: Arc<dyn PeerNetwork>,
    /// Central server client.
    pub server: Arc<dyn ServerClient>,
    /// Local shares.
    pub shares: Arc<dyn SharesIndex>,
    /// Ban list and address filters.
    pub filter: Arc<dyn NetworkFilter>,
}

/// Async handle to the transfer worker.
#[derive(Clone)]
pub struct TransferService {
    commands: mpsc::Sender<TransferCommand>,
}

impl TransferService {
    /// Spawn the worker, restore the saved transfer lists and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn start(
        config: TransferConfig,
        services: PeerServices,
        events: EventBus,
        metrics: Metrics,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("transfer service needs a tokio runtime")?;
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);

        let collaborators = Collaborators {
            network: services.network,
            server: services.server,
            shares: services.shares,
            filter: services.filter,
            scheduler: Arc::new(TokioScheduler::new(runtime.clone(), commands.clone())),
            jobs: Arc::new(BlockingJobRunner::new(runtime, commands.clone())),
        };
        let stores = worker::Stores {
            downloads: TransferStore::new(config.downloads_file()),
            uploads: TransferStore::new(config.uploads_file()),
        };
        let manager = TransferManager::new(config, collaborators, events.clone(), metrics.clone());
        worker::spawn(manager, stores, events, metrics, rx);

        Ok(Self { commands })
    }

    /// Sink the network layer posts its events to.
    #[must_use]
    pub fn network_sink(&self) -> NetworkEventSink {
        NetworkEventSink {
            commands: self.commands.clone(),
        }
    }

    /// Write both transfer lists now.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker is gone or a file cannot be written.
    pub async fn save(&self) -> Result<()> {
        self.request(|reply| TransferCommand::Save { reply }).await
    }

    async fn send_command(&self, command: TransferCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|err| anyhow!("failed to enqueue transfer command: {err}"))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> TransferCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send_command(build(reply)).await?;
        rx.await
            .map_err(|_| anyhow!("transfer worker dropped the request"))?
    }
}

#[async_trait]
impl TransferWorkflow for TransferService {
    async fn enqueue_download(&self, request: DownloadRequest) -> Result<EnqueueOutcome> {
        self.request(|reply| TransferCommand::Enqueue { request, reply })
            .await
    }

    async fn abort(
        &self,
        direction: TransferDirection,
        id: TransferId,
        delete_partial: bool,
    ) -> Result<()> {
        self.request(|reply| TransferCommand::Abort {
            direction,
            id,
            delete_partial,
            reply,
        })
        .await
    }

    async fn clear(&self, direction: TransferDirection, id: TransferId) -> Result<()> {
        self.request(|reply| TransferCommand::Clear {
            direction,
            id,
            reply,
        })
        .await
    }

    async fn pause(&self, id: TransferId) -> Result<()> {
        self.request(|reply| TransferCommand::Pause { id, reply })
            .await
    }

    async fn retry(&self, id: TransferId) -> Result<()> {
        self.request(|reply| TransferCommand::Retry { id, reply })
            .await
    }

    async fn clear_finished(&self, direction: TransferDirection) -> Result<()> {
        self.request(|reply| TransferCommand::ClearFinished { direction, reply })
            .await
    }

    async fn ban_user(&self, username: String) -> Result<()> {
        self.request(|reply| TransferCommand::BanUser { username, reply })
            .await
    }

    async fn set_privileged_users(&self, usernames: Vec<String>) -> Result<()> {
        self.request(|reply| TransferCommand::SetPrivileged { usernames, reply })
            .await
    }

    async fn list(&self, direction: TransferDirection) -> Result<Vec<TransferSnapshot>> {
        self.request(|reply| TransferCommand::List { direction, reply })
            .await
    }
}

/// Clonable entry point for network and server callbacks.
#[derive(Clone)]
pub struct NetworkEventSink {
    commands: mpsc::Sender<TransferCommand>,
}

impl NetworkEventSink {
    /// Post an event from async code.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker has stopped.
    pub async fn send(&self, event: NetworkEvent) -> Result<()> {
        self.commands
            .send(TransferCommand::Network(event))
            .await
            .map_err(|err| anyhow!("failed to enqueue network event: {err}"))
    }

    /// Post an event from a thread outside the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker has stopped.
    pub fn blocking_send(&self, event: NetworkEvent) -> Result<()> {
        self.commands
            .blocking_send(TransferCommand::Network(event))
            .map_err(|err| anyhow!("failed to enqueue network event: {err}"))
    }
}
