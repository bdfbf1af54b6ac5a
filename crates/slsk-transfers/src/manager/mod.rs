//! Transfer manager: the single owner of every transfer record.
//!
//! # Design
//! - One instance holds both directions. Ids come from one counter, so an id
//!   names a transfer regardless of direction.
//! - Every mutation happens on the caller's task; network, timer and job
//!   completions must be marshalled onto it first (the worker does this).
//! - Status changes go through [`TransferManager::transition`], which applies
//!   the negotiation rules, logs, counts and publishes a snapshot.
//! - Handler failures are logged and turned into transfer statuses; they
//!   never abort processing of other transfers.

mod downloads;
mod uploads;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use slsk_config::{DownloadSettings, TransferConfig};
use slsk_events::{
    Event, EventBus, TransferDirection, TransferId, TransferSnapshot, TransferStatus,
};
use slsk_telemetry::Metrics;
use slsk_transfer_core::{
    ConnectionId, FinalizeOutcome, IncomingTransferResponse, JobRunner, NegotiationEvent,
    NetworkEvent, NetworkFilter, PeerMessage, PeerNetwork, RejectReason, RequestToken, Scheduler,
    ServerClient, SharesIndex, TimerEvent, TokenAllocator, Transfer, TransferError,
    TransferResult,
};
use tracing::{debug, info, warn};

use crate::store::StoredTransfer;
use crate::table::TransferTable;

const PROGRESS_COALESCE_INTERVAL: Duration = Duration::from_millis(100);

/// External services the manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Peer socket layer.
    pub network: Arc<dyn PeerNetwork>,
    /// Central server client.
    pub server: Arc<dyn ServerClient>,
    /// Local shares.
    pub shares: Arc<dyn SharesIndex>,
    /// Ban list and address filters.
    pub filter: Arc<dyn NetworkFilter>,
    /// One-shot timers.
    pub scheduler: Arc<dyn Scheduler>,
    /// Blocking job pool.
    pub jobs: Arc<dyn JobRunner>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerState {
    online: Option<bool>,
    address: Option<SocketAddr>,
}

/// Owner of all uploads and downloads.
pub struct TransferManager {
    config: TransferConfig,
    collaborators: Collaborators,
    events: EventBus,
    metrics: Metrics,
    downloads: TransferTable,
    uploads: TransferTable,
    tokens: TokenAllocator,
    next_id: u64,
    peers: HashMap<String, PeerState>,
    privileged_users: HashSet<String>,
    last_served: HashMap<String, DateTime<Utc>>,
    download_filters: Vec<Regex>,
    files: HashMap<TransferId, File>,
    finalizing: HashSet<TransferId>,
    progress_last_emit: HashMap<TransferId, Instant>,
    upload_queue_dirty: bool,
}

impl TransferManager {
    /// Manager with empty transfer lists.
    #[must_use]
    pub fn new(
        config: TransferConfig,
        collaborators: Collaborators,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        let download_filters = compile_download_filters(&config.downloads);
        Self {
            config,
            collaborators,
            events,
            metrics,
            downloads: TransferTable::new(),
            uploads: TransferTable::new(),
            tokens: TokenAllocator::default(),
            next_id: 0,
            peers: HashMap::new(),
            privileged_users: HashSet::new(),
            last_served: HashMap::new(),
            download_filters,
            files: HashMap::new(),
            finalizing: HashSet::new(),
            progress_last_emit: HashMap::new(),
            upload_queue_dirty: false,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Look up a transfer in either direction.
    #[must_use]
    pub fn transfer(&self, id: TransferId) -> Option<&Transfer> {
        self.downloads.get(id).or_else(|| self.uploads.get(id))
    }

    /// All transfers of `direction`, in insertion order.
    pub fn transfers(&self, direction: TransferDirection) -> impl Iterator<Item = &Transfer> {
        self.table(direction).iter()
    }

    /// Snapshots of every transfer in `direction`.
    #[must_use]
    pub fn snapshots(&self, direction: TransferDirection) -> Vec<TransferSnapshot> {
        self.table(direction).iter().map(Transfer::snapshot).collect()
    }

    /// Rows to persist: every download, and finished uploads only.
    #[must_use]
    pub fn persisted(&self, direction: TransferDirection) -> Vec<StoredTransfer> {
        self.table(direction)
            .iter()
            .filter(|transfer| {
                direction == TransferDirection::Download
                    || *transfer.status() == TransferStatus::Finished
            })
            .map(StoredTransfer::from_transfer)
            .collect()
    }

    /// Rebuild transfers saved by a previous session.
    ///
    /// Downloads that were mid-flight come back as `User logged off` (or
    /// `Finished` when every byte had arrived); aborted and paused ones come
    /// back paused. Only finished uploads are restored.
    pub fn restore(&mut self, direction: TransferDirection, rows: Vec<StoredTransfer>) {
        let mut restored = 0_usize;
        for row in rows {
            let status = match direction {
                TransferDirection::Download => restored_download_status(&row),
                TransferDirection::Upload if row.status == TransferStatus::Finished => {
                    TransferStatus::Finished
                }
                TransferDirection::Upload => continue,
            };
            let id = self.allocate_id();
            let transfer = Transfer::new(
                id,
                direction,
                row.username,
                row.virtual_path,
                PathBuf::from(row.folder_path),
                Utc::now(),
            )
            .with_status(status)
            .with_size(row.size)
            .with_offset(row.current_byte_offset)
            .with_attributes(row.file_attributes);
            let snapshot = transfer.snapshot();
            self.table_mut(direction).insert(transfer);
            self.events.publish(Event::TransferAdded { snapshot });
            restored += 1;
        }
        info!(direction = direction.as_str(), restored, "transfer list restored");
    }

    /// Resume restored downloads and fill free upload slots.
    pub fn start(&mut self) {
        let pending: Vec<TransferId> = self
            .downloads
            .iter()
            .filter(|transfer| {
                matches!(
                    transfer.status(),
                    TransferStatus::Queued | TransferStatus::UserLoggedOff
                )
            })
            .map(|transfer| transfer.id)
            .collect();
        for id in pending {
            if let Err(err) = self.activate_download(id) {
                warn!(transfer_id = %id, error = %err, "failed to resume download");
            }
        }
        self.upload_queue_dirty = true;
        self.after_event();
    }

    /// Apply one event from the network layer or the server client.
    pub fn handle_network_event(&mut self, event: NetworkEvent) {
        let name = event.name();
        let result = match event {
            NetworkEvent::UserStatusChanged { username, online } => {
                self.on_user_status(&username, online)
            }
            NetworkEvent::PeerResolved { username, address } => {
                self.on_peer_resolved(&username, address)
            }
            NetworkEvent::PeerConnectFailed { username, token } => {
                self.on_peer_connect_failed(&username, token)
            }
            NetworkEvent::TransferRequest(request) => match request.direction {
                TransferDirection::Upload => self.on_upload_offer(request),
                TransferDirection::Download => self.on_legacy_upload_request(request),
            },
            NetworkEvent::TransferResponse(response) => self.on_transfer_response(response),
            NetworkEvent::QueueUpload {
                username,
                address,
                virtual_path,
                file_attributes,
            } => self.on_queue_upload(&username, address, &virtual_path, file_attributes),
            NetworkEvent::PlaceInQueueRequest {
                username,
                virtual_path,
            } => self.on_place_in_queue_request(&username, &virtual_path),
            NetworkEvent::PlaceInQueueResponse {
                username,
                virtual_path,
                place,
            } => self.on_place_in_queue_response(&username, &virtual_path, place),
            NetworkEvent::QueueFailed {
                username,
                virtual_path,
                reason,
            } => self.on_queue_failed(&username, &virtual_path, &reason),
            NetworkEvent::UploadFailed {
                username,
                virtual_path,
            } => self.on_remote_upload_failed(&username, &virtual_path),
            NetworkEvent::FileConnectionEstablished {
                username,
                token,
                connection,
            } => self.on_file_connection(&username, token, connection),
            NetworkEvent::FileOffset { connection, offset } => {
                self.on_file_offset(connection, offset)
            }
            NetworkEvent::BytesReceived { connection, chunk } => {
                self.on_bytes_received(connection, &chunk)
            }
            NetworkEvent::ReadyToSend {
                connection,
                max_bytes,
            } => self.on_ready_to_send(connection, max_bytes),
            NetworkEvent::BytesTransferred {
                connection,
                byte_count,
            } => self.on_bytes_transferred(connection, byte_count),
            NetworkEvent::ConnectionClosed { connection } => self.on_connection_closed(connection),
        };
        if let Err(err) = result {
            warn!(event = name, error = %err, "transfer event handling failed");
        }
        self.after_event();
    }

    /// Apply a fired timer.
    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::RequestTimeout { transfer_id, token } => {
                self.on_request_timeout(transfer_id, token);
            }
        }
        self.after_event();
    }

    /// Apply the outcome of a finalize job.
    pub fn handle_finalized(&mut self, transfer_id: TransferId, outcome: FinalizeOutcome) {
        if let Err(err) = self.on_download_finalized(transfer_id, outcome) {
            warn!(transfer_id = %transfer_id, error = %err, "download finalization failed");
        }
        self.after_event();
    }

    /// Stop a transfer. A finished transfer, or a download whose file is
    /// being moved into place, is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] when no such transfer exists.
    pub fn abort(
        &mut self,
        direction: TransferDirection,
        id: TransferId,
        delete_partial: bool,
    ) -> TransferResult<()> {
        let transfer = self
            .table(direction)
            .get(id)
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        if *transfer.status() == TransferStatus::Finished {
            return Ok(());
        }
        if self.finalizing.contains(&id) {
            debug!(transfer_id = %id, "download is being finalized; abort ignored");
            return Ok(());
        }
        let was_pending =
            transfer.status().is_active() || *transfer.status() == TransferStatus::Queued;
        let username = transfer.username.clone();
        let virtual_path = transfer.virtual_path.clone();

        self.release(direction, id);
        self.transition(direction, id, &NegotiationEvent::Abort)?;

        match direction {
            TransferDirection::Upload if was_pending => {
                self.send(
                    &username,
                    PeerMessage::UploadDenied {
                        virtual_path,
                        reason: RejectReason::Cancelled,
                    },
                );
            }
            TransferDirection::Download if delete_partial => self.delete_partial(id),
            _ => {}
        }
        self.after_event();
        Ok(())
    }

    /// Remove a transfer from the list, stopping it first.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] when no such transfer exists.
    pub fn clear(&mut self, direction: TransferDirection, id: TransferId) -> TransferResult<()> {
        let transfer = self
            .table(direction)
            .get(id)
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        if transfer.status().is_active() || *transfer.status() == TransferStatus::Queued {
            self.abort(direction, id, false)?;
        }
        self.remove(direction, id);
        self.after_event();
        Ok(())
    }

    /// Remove every finished transfer of `direction`.
    pub fn clear_finished(&mut self, direction: TransferDirection) {
        let finished: Vec<TransferId> = self
            .table(direction)
            .iter()
            .filter(|transfer| *transfer.status() == TransferStatus::Finished)
            .map(|transfer| transfer.id)
            .collect();
        for id in finished {
            self.remove(direction, id);
        }
    }

    fn after_event(&mut self) {
        if std::mem::take(&mut self.upload_queue_dirty) {
            self.check_upload_queue();
        }
        self.metrics
            .set_upload_gauges(self.uploads.active_count(), self.uploads.queued_count());
        self.metrics.set_active_downloads(self.downloads.active_count());
    }

    const fn table(&self, direction: TransferDirection) -> &TransferTable {
        match direction {
            TransferDirection::Download => &self.downloads,
            TransferDirection::Upload => &self.uploads,
        }
    }

    const fn table_mut(&mut self, direction: TransferDirection) -> &mut TransferTable {
        match direction {
            TransferDirection::Download => &mut self.downloads,
            TransferDirection::Upload => &mut self.uploads,
        }
    }

    fn locate(&self, id: TransferId) -> Option<TransferDirection> {
        if self.downloads.contains(id) {
            Some(TransferDirection::Download)
        } else if self.uploads.contains(id) {
            Some(TransferDirection::Upload)
        } else {
            None
        }
    }

    const fn allocate_id(&mut self) -> TransferId {
        self.next_id += 1;
        TransferId(self.next_id)
    }

    fn allocate_token(&mut self) -> RequestToken {
        let downloads = &self.downloads;
        let uploads = &self.uploads;
        self.tokens
            .allocate(|token| downloads.token_in_use(token) || uploads.token_in_use(token))
    }

    fn insert(&mut self, transfer: Transfer) {
        let direction = transfer.direction;
        let snapshot = transfer.snapshot();
        if let Some(replaced) = self.table_mut(direction).insert(transfer) {
            self.events.publish(Event::TransferRemoved {
                transfer_id: replaced.id,
                direction,
            });
        }
        if direction == TransferDirection::Upload {
            self.upload_queue_dirty = true;
        }
        self.events.publish(Event::TransferAdded { snapshot });
    }

    fn remove(&mut self, direction: TransferDirection, id: TransferId) {
        self.release(direction, id);
        self.finalizing.remove(&id);
        if self.table_mut(direction).remove(id).is_some() {
            if direction == TransferDirection::Upload {
                self.upload_queue_dirty = true;
            }
            self.events.publish(Event::TransferRemoved {
                transfer_id: id,
                direction,
            });
        }
    }

    /// Feed `event` to a transfer and publish the result.
    ///
    /// While a download is being finalized only the job's own outcome may
    /// move it.
    fn transition(
        &mut self,
        direction: TransferDirection,
        id: TransferId,
        event: &NegotiationEvent,
    ) -> TransferResult<TransferStatus> {
        if self.finalizing.contains(&id)
            && !matches!(
                event,
                NegotiationEvent::Completed | NegotiationEvent::LocalFailure(_)
            )
        {
            let status = self
                .table(direction)
                .get(id)
                .map(|transfer| transfer.status().clone())
                .ok_or(TransferError::NotFound { transfer_id: id })?;
            debug!(transfer_id = %id, event = event.name(), "download is being finalized; event ignored");
            return Ok(status);
        }
        let (from, to) = self
            .table_mut(direction)
            .update(id, |transfer| {
                let from = transfer.status().clone();
                transfer.apply(event).map(|to| (from, to.clone()))
            })
            .ok_or(TransferError::NotFound { transfer_id: id })??;

        if from != to {
            self.record_status_change(direction, id, &from, &to);
        }
        self.publish_update(direction, id);
        Ok(to)
    }

    fn record_status_change(
        &mut self,
        direction: TransferDirection,
        id: TransferId,
        from: &TransferStatus,
        to: &TransferStatus,
    ) {
        let label = direction.as_str();
        if *to == TransferStatus::Finished {
            self.metrics.inc_transfer_finished(label);
            info!(direction = label, transfer_id = %id, "transfer finished");
        } else if is_failure(to) {
            self.metrics.inc_transfer_failed(label, status_label(to));
            info!(direction = label, transfer_id = %id, from = %from, to = %to, "transfer stopped");
        } else {
            debug!(direction = label, transfer_id = %id, from = %from, to = %to, "transfer status changed");
        }

        if direction == TransferDirection::Upload
            && (from.is_active() != to.is_active() || *to == TransferStatus::Queued)
        {
            self.upload_queue_dirty = true;
        }
        // A stopped upload counts as service for round-robin ordering.
        if direction == TransferDirection::Upload
            && from.is_active()
            && !to.is_active()
            && let Some(username) = self.uploads.get(id).map(|transfer| transfer.username.clone())
        {
            self.last_served.insert(username, Utc::now());
        }
        if !to.is_active() {
            self.progress_last_emit.remove(&id);
        }
    }

    fn publish_update(&self, direction: TransferDirection, id: TransferId) {
        if let Some(transfer) = self.table(direction).get(id) {
            self.events.publish(Event::TransferUpdated {
                snapshot: transfer.snapshot(),
            });
        }
    }

    fn publish_progress(&mut self, direction: TransferDirection, id: TransferId) {
        if self.should_emit_progress(id) {
            self.publish_update(direction, id);
        }
    }

    fn should_emit_progress(&mut self, id: TransferId) -> bool {
        let now = Instant::now();
        if let Some(last) = self.progress_last_emit.get_mut(&id) {
            if now.duration_since(*last) >= PROGRESS_COALESCE_INTERVAL {
                *last = now;
                true
            } else {
                false
            }
        } else {
            self.progress_last_emit.insert(id, now);
            true
        }
    }

    /// Cancel the timer, close the connection and drop the file of a transfer.
    fn release(&mut self, direction: TransferDirection, id: TransferId) {
        let Some(detached) = self.table_mut(direction).update(id, Transfer::detach) else {
            return;
        };
        if let Some(timer) = detached.timer {
            self.collaborators.scheduler.cancel(timer);
        }
        if let Some(connection) = detached.connection {
            self.collaborators.network.close_connection(connection);
        }
        self.files.remove(&id);
    }

    fn disarm(&mut self, direction: TransferDirection, id: TransferId) {
        let timer = self
            .table_mut(direction)
            .update(id, |transfer| transfer.timer.take())
            .flatten();
        if let Some(timer) = timer {
            self.collaborators.scheduler.cancel(timer);
        }
    }

    fn arm_timer(&mut self, direction: TransferDirection, id: TransferId, token: Option<RequestToken>) {
        self.disarm(direction, id);
        let timer = self.collaborators.scheduler.schedule(
            self.config.network.request_timeout(),
            TimerEvent::RequestTimeout {
                transfer_id: id,
                token,
            },
        );
        self.table_mut(direction)
            .update(id, |transfer| transfer.timer = Some(timer));
    }

    fn send(&self, username: &str, message: PeerMessage) -> bool {
        let name = message.name();
        match self.collaborators.network.send_message(username, message) {
            Ok(()) => true,
            Err(err) => {
                warn!(user = %username, message = name, error = %err, "failed to send peer message");
                false
            }
        }
    }

    fn peer(&self, username: &str) -> PeerState {
        self.peers.get(username).copied().unwrap_or_default()
    }

    /// Ask the server about the peer, or continue straight away when its
    /// state is known.
    fn contact_peer(&mut self, direction: TransferDirection, id: TransferId) -> TransferResult<()> {
        let username = self
            .table(direction)
            .get(id)
            .map(|transfer| transfer.username.clone())
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        match self.peer(&username).online {
            Some(true) => self.peer_online(direction, id),
            Some(false) => {
                self.release(direction, id);
                self.transition(direction, id, &NegotiationEvent::PeerOffline)
                    .map(|_| ())
            }
            None => {
                self.collaborators.server.watch_user(&username);
                self.arm_timer(direction, id, None);
                Ok(())
            }
        }
    }

    fn peer_online(&mut self, direction: TransferDirection, id: TransferId) -> TransferResult<()> {
        let username = self
            .table(direction)
            .get(id)
            .map(|transfer| transfer.username.clone())
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        let address_known = self.peer(&username).address.is_some();
        self.transition(direction, id, &NegotiationEvent::PeerOnline { address_known })?;
        if address_known {
            self.send_request(direction, id)
        } else {
            self.collaborators.server.request_user_address(&username);
            Ok(())
        }
    }

    /// Downloads ask the peer to queue the file; uploads send a transfer
    /// request with a fresh token and arm its timer.
    fn send_request(&mut self, direction: TransferDirection, id: TransferId) -> TransferResult<()> {
        let (username, virtual_path, size) = self
            .table(direction)
            .get(id)
            .map(|transfer| {
                (
                    transfer.username.clone(),
                    transfer.virtual_path.clone(),
                    transfer.size,
                )
            })
            .ok_or(TransferError::NotFound { transfer_id: id })?;

        if direction == TransferDirection::Download {
            self.disarm(direction, id);
            if self.send(&username, PeerMessage::QueueUpload { virtual_path }) {
                self.transition(direction, id, &NegotiationEvent::Requeue)?;
            } else {
                self.release(direction, id);
                self.transition(direction, id, &NegotiationEvent::ConnectFailed)?;
            }
            return Ok(());
        }

        let token = self.allocate_token();
        let message = PeerMessage::TransferRequest {
            direction,
            token,
            virtual_path,
            size: Some(size),
        };
        if !self.send(&username, message) {
            self.release(direction, id);
            self.transition(direction, id, &NegotiationEvent::ConnectFailed)?;
            return Ok(());
        }
        self.table_mut(direction)
            .update(id, |transfer| transfer.request_token = Some(token));
        self.transition(direction, id, &NegotiationEvent::RequestSent)?;
        self.arm_timer(direction, id, Some(token));
        debug!(user = %username, token = %token, "transfer request sent");
        Ok(())
    }

    fn on_user_status(&mut self, username: &str, online: bool) -> TransferResult<()> {
        let state = self.peers.entry(username.to_string()).or_default();
        state.online = Some(online);
        if !online {
            state.address = None;
        }
        debug!(user = %username, online, "peer status changed");

        for direction in [TransferDirection::Download, TransferDirection::Upload] {
            for id in self.table(direction).ids_for_user(username) {
                let Some(status) = self.table(direction).get(id).map(|t| t.status().clone())
                else {
                    continue;
                };
                let result = if !online {
                    let remotely_queued = direction == TransferDirection::Download
                        && status == TransferStatus::Queued;
                    if status.is_active() || remotely_queued {
                        self.release(direction, id);
                        self.transition(direction, id, &NegotiationEvent::PeerOffline)
                            .map(|_| ())
                    } else {
                        Ok(())
                    }
                } else if status == TransferStatus::GettingStatus {
                    self.disarm(direction, id);
                    self.peer_online(direction, id)
                } else if direction == TransferDirection::Download
                    && status == TransferStatus::UserLoggedOff
                {
                    self.activate_download(id)
                } else {
                    Ok(())
                };
                if let Err(err) = result {
                    warn!(user = %username, transfer_id = %id, error = %err, "peer status handling failed");
                }
            }
        }
        Ok(())
    }

    fn on_peer_resolved(&mut self, username: &str, address: SocketAddr) -> TransferResult<()> {
        let state = self.peers.entry(username.to_string()).or_default();
        state.address = Some(address);
        state.online = Some(true);

        for direction in [TransferDirection::Download, TransferDirection::Upload] {
            for id in self.table(direction).ids_for_user(username) {
                let waiting = self.table(direction).get(id).is_some_and(|transfer| {
                    matches!(
                        transfer.status(),
                        TransferStatus::GettingStatus | TransferStatus::GettingAddress
                    )
                });
                if !waiting {
                    continue;
                }
                let result = self
                    .transition(direction, id, &NegotiationEvent::AddressResolved)
                    .and_then(|_| self.send_request(direction, id));
                if let Err(err) = result {
                    warn!(user = %username, transfer_id = %id, error = %err, "request after address resolution failed");
                }
            }
        }
        Ok(())
    }

    fn on_peer_connect_failed(
        &mut self,
        username: &str,
        token: Option<RequestToken>,
    ) -> TransferResult<()> {
        let mut failed = Vec::new();
        for direction in [TransferDirection::Download, TransferDirection::Upload] {
            match token {
                Some(token) => {
                    if let Some(transfer) = self.table(direction).find_by_token(username, token) {
                        failed.push((direction, transfer.id));
                    }
                }
                None => failed.extend(
                    self.table(direction)
                        .iter()
                        .filter(|transfer| {
                            transfer.username == username
                                && matches!(
                                    transfer.status(),
                                    TransferStatus::Connecting | TransferStatus::Requesting
                                )
                        })
                        .map(|transfer| (direction, transfer.id)),
                ),
            }
        }

        for (direction, id) in failed {
            info!(user = %username, transfer_id = %id, "cannot connect to peer");
            self.release(direction, id);
            self.transition(direction, id, &NegotiationEvent::ConnectFailed)?;
            if direction == TransferDirection::Upload {
                self.report_upload_failure(id);
            }
        }
        Ok(())
    }

    fn on_transfer_response(&mut self, response: IncomingTransferResponse) -> TransferResult<()> {
        let Some((id, status)) = self
            .uploads
            .find_by_token(&response.username, response.token)
            .map(|transfer| (transfer.id, transfer.status().clone()))
        else {
            debug!(user = %response.username, token = %response.token, "response to unknown request");
            return Ok(());
        };
        if status != TransferStatus::Requesting {
            debug!(transfer_id = %id, status = %status, "ignoring late transfer response");
            return Ok(());
        }
        self.disarm(TransferDirection::Upload, id);
        self.on_upload_response(id, response)
    }

    fn on_file_connection(
        &mut self,
        username: &str,
        token: RequestToken,
        connection: ConnectionId,
    ) -> TransferResult<()> {
        if let Some(id) = self
            .downloads
            .find_by_token(username, token)
            .map(|transfer| transfer.id)
        {
            return self.attach_download(id, connection);
        }
        if let Some(id) = self
            .uploads
            .find_by_token(username, token)
            .map(|transfer| transfer.id)
        {
            return self.attach_upload(id, connection);
        }
        debug!(user = %username, token = %token, "file connection for unknown transfer");
        self.collaborators.network.close_connection(connection);
        Ok(())
    }

    fn on_request_timeout(&mut self, id: TransferId, token: Option<RequestToken>) {
        let Some(direction) = self.locate(id) else {
            return;
        };
        let stale = self.table(direction).get(id).is_none_or(|transfer| {
            transfer.request_token != token || !transfer.status().is_negotiating()
        });
        if stale {
            debug!(transfer_id = %id, "ignoring stale request timer");
            return;
        }

        // The timer already fired; nothing left to cancel.
        self.table_mut(direction)
            .update(id, |transfer| transfer.timer = None);
        self.release(direction, id);
        info!(transfer_id = %id, direction = direction.as_str(), "peer did not respond in time");
        match self.transition(direction, id, &NegotiationEvent::TimedOut) {
            Ok(_) if direction == TransferDirection::Upload => self.report_upload_failure(id),
            Ok(_) => {}
            Err(err) => warn!(transfer_id = %id, error = %err, "timeout handling failed"),
        }
    }

    fn on_connection_closed(
        &mut self,
        connection: ConnectionId,
    ) -> TransferResult<()> {
        let found = [TransferDirection::Download, TransferDirection::Upload]
            .into_iter()
            .find_map(|direction| {
                self.table(direction)
                    .find_by_connection(connection)
                    .map(|transfer| (direction, transfer.id, transfer.username.clone()))
            });
        let Some((direction, id, username)) = found else {
            debug!(connection = %connection, "closed connection has no transfer");
            return Ok(());
        };

        let peer_offline = self.peer(&username).online == Some(false);
        // The peer closed it; drop our handle without closing again.
        self.table_mut(direction)
            .update(id, |transfer| transfer.connection = None);
        self.release(direction, id);
        self.transition(
            direction,
            id,
            &NegotiationEvent::ConnectionLost { peer_offline },
        )?;
        if direction == TransferDirection::Upload {
            self.report_upload_failure(id);
        }
        Ok(())
    }
}

fn restored_download_status(row: &StoredTransfer) -> TransferStatus {
    match &row.status {
        TransferStatus::Aborted | TransferStatus::Paused => TransferStatus::Paused,
        TransferStatus::Filtered | TransferStatus::Finished => row.status.clone(),
        _ if row.size > 0
            && row
                .current_byte_offset
                .is_some_and(|offset| offset >= row.size) =>
        {
            TransferStatus::Finished
        }
        _ => TransferStatus::UserLoggedOff,
    }
}

fn is_failure(status: &TransferStatus) -> bool {
    status.is_retryable()
        || status.is_local_failure()
        || matches!(
            status,
            TransferStatus::UserLoggedOff | TransferStatus::Rejected(_)
        )
}

fn status_label(status: &TransferStatus) -> &str {
    match status {
        TransferStatus::Rejected(_) => "rejected",
        other => other.as_str(),
    }
}

/// Filters match the last path component (or a trailing run of them),
/// case-insensitively.
fn compile_download_filters(settings: &DownloadSettings) -> Vec<Regex> {
    if !settings.enable_filters {
        return Vec::new();
    }
    settings
        .filters
        .iter()
        .filter_map(|filter| {
            let body = if filter.escaped {
                regex::escape(&filter.pattern).replace(r"\*", ".*")
            } else {
                filter.pattern.clone()
            };
            match RegexBuilder::new(&format!(r"\\(?:{body})$"))
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(pattern = %filter.pattern, error = %err, "ignoring invalid download filter");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use slsk_config::DownloadFilter;

    fn filters(entries: &[(&str, bool)]) -> Vec<Regex> {
        let mut settings = DownloadSettings::default();
        settings.enable_filters = true;
        settings.filters = entries
            .iter()
            .map(|(pattern, escaped)| DownloadFilter {
                pattern: (*pattern).to_string(),
                escaped: *escaped,
            })
            .collect();
        compile_download_filters(&settings)
    }

    #[test]
    fn escaped_filters_use_wildcards() {
        let compiled = filters(&[("*.nfo", true), ("desktop.ini", true)]);
        assert_eq!(compiled.len(), 2);
        assert!(compiled[0].is_match("Music\\Album\\info.NFO"));
        assert!(!compiled[0].is_match("Music\\Album\\info.nfo.mp3"));
        assert!(compiled[1].is_match("Music\\Album\\Desktop.ini"));
        assert!(!compiled[1].is_match("Music\\Album\\mydesktop.ini"));
    }

    #[test]
    fn invalid_regex_filters_are_skipped() {
        let compiled = filters(&[("(unclosed", false), (r".*\.url", false)]);
        assert_eq!(compiled.len(), 1);
        assert!(compiled[0].is_match("x\\link.url"));
    }

    #[test]
    fn disabled_filters_compile_to_nothing() {
        let mut settings = DownloadSettings::default();
        settings.filters = vec![DownloadFilter {
            pattern: "*".into(),
            escaped: true,
        }];
        assert!(compile_download_filters(&settings).is_empty());
    }

    #[test]
    fn restored_status_follows_previous_session() {
        let row = |status: TransferStatus, size: u64, offset: Option<u64>| StoredTransfer {
            username: "u".into(),
            virtual_path: "p".into(),
            folder_path: String::new(),
            status,
            size,
            current_byte_offset: offset,
            file_attributes: slsk_transfer_core::FileAttributes::new(),
        };
        assert_eq!(
            restored_download_status(&row(TransferStatus::Aborted, 10, Some(5))),
            TransferStatus::Paused
        );
        assert_eq!(
            restored_download_status(&row(TransferStatus::Transferring, 10, Some(10))),
            TransferStatus::Finished
        );
        assert_eq!(
            restored_download_status(&row(TransferStatus::Transferring, 10, Some(4))),
            TransferStatus::UserLoggedOff
        );
        assert_eq!(
            restored_download_status(&row(TransferStatus::Queued, 0, None)),
            TransferStatus::UserLoggedOff
        );
        assert_eq!(
            restored_download_status(&row(TransferStatus::Filtered, 0, None)),
            TransferStatus::Filtered
        );
    }
}
