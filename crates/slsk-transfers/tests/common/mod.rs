#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use slsk_config::TransferConfig;
use slsk_events::{EventBus, TransferDirection, TransferId, TransferStatus};
use slsk_telemetry::Metrics;
use slsk_test_support::fakes::Fakes;
use slsk_test_support::fixtures::Workspace;
use slsk_transfer_core::{FileAttributes, IncomingTransferResponse, NetworkEvent, RequestToken};
use slsk_transfers::{Collaborators, TransferManager};

pub fn collaborators(fakes: &Fakes) -> Collaborators {
    Collaborators {
        network: fakes.network.clone(),
        server: fakes.server.clone(),
        shares: fakes.shares.clone(),
        filter: fakes.filter.clone(),
        scheduler: fakes.scheduler.clone(),
        jobs: fakes.jobs.clone(),
    }
}

/// A manager wired to recording fakes inside a scratch workspace.
pub struct Harness {
    pub workspace: Workspace,
    pub fakes: Fakes,
    pub events: EventBus,
    pub metrics: Metrics,
    pub manager: TransferManager,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut TransferConfig)) -> Result<Self> {
        let workspace = Workspace::new()?;
        let mut config = workspace.config();
        adjust(&mut config);
        let fakes = Fakes::default();
        let events = EventBus::new();
        let metrics = Metrics::new()?;
        let manager = TransferManager::new(
            config,
            collaborators(&fakes),
            events.clone(),
            metrics.clone(),
        );
        Ok(Self {
            workspace,
            fakes,
            events,
            metrics,
            manager,
        })
    }

    pub fn status(&self, id: TransferId) -> Option<TransferStatus> {
        self.manager
            .transfer(id)
            .map(|transfer| transfer.status().clone())
    }

    pub fn upload_id(&self, username: &str, virtual_path: &str) -> Option<TransferId> {
        self.manager
            .transfers(TransferDirection::Upload)
            .find(|transfer| transfer.matches(username, virtual_path))
            .map(|transfer| transfer.id)
    }

    /// Share a real file under `virtual_path`.
    pub fn share(&self, virtual_path: &str, contents: &[u8]) -> Result<()> {
        let name = virtual_path.replace('\\', "/");
        let file = self.workspace.shared_file(&name, contents)?;
        self.fakes.shares.add(virtual_path, file);
        Ok(())
    }

    pub fn queue_upload(&mut self, username: &str, virtual_path: &str) {
        self.manager.handle_network_event(NetworkEvent::QueueUpload {
            username: username.to_string(),
            address: None,
            virtual_path: virtual_path.to_string(),
            file_attributes: FileAttributes::new(),
        });
    }

    /// Report `username` online with a known address.
    pub fn peer_reachable(&mut self, username: &str) {
        self.manager.handle_network_event(NetworkEvent::UserStatusChanged {
            username: username.to_string(),
            online: true,
        });
        self.manager.handle_network_event(NetworkEvent::PeerResolved {
            username: username.to_string(),
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 2234)),
        });
    }

    pub fn peer_offline(&mut self, username: &str) {
        self.manager.handle_network_event(NetworkEvent::UserStatusChanged {
            username: username.to_string(),
            online: false,
        });
    }

    /// Most recent transfer request token sent to `username`.
    pub fn last_request_token(&self, username: &str) -> Option<RequestToken> {
        self.fakes.network.request_tokens(username).last().copied()
    }

    pub fn answer(&mut self, username: &str, token: RequestToken, allowed: bool) {
        self.manager
            .handle_network_event(NetworkEvent::TransferResponse(IncomingTransferResponse {
                username: username.to_string(),
                token,
                allowed,
                reason: None,
                size: None,
            }));
    }

    /// Expire every pending timer.
    pub fn fire_timers(&mut self) {
        for event in self.fakes.scheduler.fire_all() {
            self.manager.handle_timer(event);
        }
    }
}

/// Keep wall-clock timestamps of consecutive steps apart.
pub fn tick() {
    thread::sleep(Duration::from_millis(2));
}
