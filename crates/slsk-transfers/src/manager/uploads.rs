//! Upload side of the manager: admission, queue activation and sending files.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::net::IpAddr;
use std::time::Instant;

use chrono::Utc;
use slsk_config::QuotaAccounting;
use slsk_events::{Event, TransferDirection, TransferId, TransferStatus};
use slsk_transfer_core::{
    Admission, ConnectionId, FileAttributes, IncomingTransferRequest, IncomingTransferResponse,
    NegotiationEvent, PeerMessage, PolicyContext, RejectReason, RequestToken, SharedFile, Transfer,
    TransferError, TransferResult, queue_position, select_candidate,
};
use tracing::{debug, info, warn};

use super::TransferManager;
use crate::table::Tally;

const UPLOAD: TransferDirection = TransferDirection::Upload;

impl TransferManager {
    /// Replace the server-granted privileged users.
    pub fn set_privileged_users(&mut self, usernames: impl IntoIterator<Item = String>) {
        self.privileged_users = usernames.into_iter().collect();
        debug!(count = self.privileged_users.len(), "privileged users replaced");
        self.upload_queue_dirty = true;
        self.after_event();
    }

    /// Grant one user privileges.
    pub fn add_privileged_user(&mut self, username: impl Into<String>) {
        if self.privileged_users.insert(username.into()) {
            self.upload_queue_dirty = true;
            self.after_event();
        }
    }

    /// Ban a user and drop every upload of theirs.
    pub fn ban_user(&mut self, username: &str) {
        self.collaborators.filter.ban_user(username);
        let reason = RejectReason::Banned(self.config.uploads.custom_ban_message.clone());
        for id in self.uploads.ids_for_user(username) {
            let Some(transfer) = self.uploads.get(id) else {
                continue;
            };
            let live = transfer.status().is_active() || *transfer.status() == TransferStatus::Queued;
            let virtual_path = transfer.virtual_path.clone();
            if live {
                self.send(
                    username,
                    PeerMessage::UploadDenied {
                        virtual_path,
                        reason: reason.clone(),
                    },
                );
            }
            self.remove(UPLOAD, id);
        }
        info!(user = %username, "user banned");
        self.after_event();
    }

    /// Next queued upload the policy would activate.
    #[must_use]
    pub fn get_upload_candidate(&self) -> Option<TransferId> {
        let privileged = self.effective_privileged_users();
        let context = self.policy_context(&privileged);
        select_candidate(self.uploads.iter(), &context).map(|transfer| transfer.id)
    }

    /// Periodic queue check. Starts what the limits allow and refreshes the
    /// upload gauges.
    pub fn tick_upload_queue(&mut self) {
        self.upload_queue_dirty = true;
        self.after_event();
    }

    /// Start queued uploads while limits allow and nothing else is being
    /// negotiated.
    pub(super) fn check_upload_queue(&mut self) {
        while !self.upload_limits_reached() && !self.upload_negotiating() {
            let Some(id) = self.get_upload_candidate() else {
                break;
            };
            if let Some(username) = self.uploads.get(id).map(|transfer| transfer.username.clone()) {
                self.last_served.insert(username, Utc::now());
            }
            if let Err(err) = self.activate_upload(id) {
                warn!(transfer_id = %id, error = %err, "failed to start upload");
                break;
            }
        }
        self.upload_queue_dirty = false;
    }

    pub(super) fn on_queue_upload(
        &mut self,
        username: &str,
        address: Option<IpAddr>,
        virtual_path: &str,
        file_attributes: FileAttributes,
    ) -> TransferResult<()> {
        match self.admit(username, address, virtual_path) {
            Ok(shared) => {
                let transfer = self.new_upload(username, virtual_path, shared, file_attributes);
                info!(user = %username, virtual_path = %virtual_path, "upload queued");
                self.insert(transfer);
                Ok(())
            }
            Err(TransferError::AlreadyQueued { transfer_id }) => {
                debug!(transfer_id = %transfer_id, "upload already queued");
                Ok(())
            }
            Err(TransferError::Rejected { reason }) => {
                self.deny_upload(username, virtual_path, reason);
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Old clients ask for a file with a transfer request instead of queueing it.
    pub(super) fn on_legacy_upload_request(
        &mut self,
        request: IncomingTransferRequest,
    ) -> TransferResult<()> {
        let IncomingTransferRequest {
            username,
            address,
            token,
            virtual_path,
            ..
        } = request;
        let shared = match self.admit(&username, address, &virtual_path) {
            Ok(shared) => shared,
            Err(TransferError::Rejected { reason }) => {
                self.metrics.inc_upload_denied(reason.label());
                self.respond(&username, token, Err(reason));
                return Ok(());
            }
            Err(TransferError::AlreadyQueued { .. }) => {
                self.respond(&username, token, Err(RejectReason::Queued));
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        let size = shared.size;
        let accept_now = !self.upload_limits_reached()
            && !self.upload_negotiating()
            && self.uploads.counters(&username).active.files == 0;
        let transfer = self.new_upload(&username, &virtual_path, shared, FileAttributes::new());
        let id = transfer.id;
        self.insert(transfer);
        if !accept_now {
            self.respond(&username, token, Err(RejectReason::Queued));
            return Ok(());
        }

        self.uploads
            .update(id, |transfer| transfer.request_token = Some(token));
        self.transition(
            UPLOAD,
            id,
            &NegotiationEvent::IncomingAccepted { we_connect: true },
        )?;
        self.last_served.insert(username.clone(), Utc::now());
        self.respond(&username, token, Ok(size));
        self.connect_for_upload(id, &username, token)
    }

    pub(super) fn on_upload_response(
        &mut self,
        id: TransferId,
        response: IncomingTransferResponse,
    ) -> TransferResult<()> {
        let IncomingTransferResponse {
            username,
            token,
            allowed,
            reason,
            ..
        } = response;
        if allowed {
            self.transition(UPLOAD, id, &NegotiationEvent::Accepted { we_connect: true })?;
            return self.connect_for_upload(id, &username, token);
        }

        let reason = reason.unwrap_or(RejectReason::Cancelled);
        info!(user = %username, transfer_id = %id, reason = %reason, "peer refused upload");
        self.release(UPLOAD, id);
        match reason {
            RejectReason::Queued | RejectReason::Cancelled | RejectReason::DisallowedExtension => {
                self.transition(UPLOAD, id, &NegotiationEvent::Abort)?;
                if self.config.uploads.autoclear_finished {
                    self.remove(UPLOAD, id);
                }
            }
            other => {
                self.transition(
                    UPLOAD,
                    id,
                    &NegotiationEvent::Rejected(TransferStatus::Rejected(other.as_text())),
                )?;
            }
        }
        Ok(())
    }

    pub(super) fn on_place_in_queue_request(
        &mut self,
        username: &str,
        virtual_path: &str,
    ) -> TransferResult<()> {
        let privileged = self.effective_privileged_users();
        let context = self.policy_context(&privileged);
        let place = self
            .uploads
            .find(username, virtual_path)
            .and_then(|target| queue_position(self.uploads.iter(), target, &context));
        if let Some(place) = place {
            self.send(
                username,
                PeerMessage::PlaceInQueueResponse {
                    virtual_path: virtual_path.to_string(),
                    place,
                },
            );
        }
        Ok(())
    }

    /// The downloader accepted our file connection: open the shared file.
    pub(super) fn attach_upload(
        &mut self,
        id: TransferId,
        connection: ConnectionId,
    ) -> TransferResult<()> {
        self.disarm(UPLOAD, id);
        self.uploads.update(id, |transfer| {
            transfer.request_token = None;
            transfer.connection = Some(connection);
        });
        self.transition(UPLOAD, id, &NegotiationEvent::FileConnected)?;

        let (username, virtual_path, path) = self
            .uploads
            .get(id)
            .map(|transfer| {
                (
                    transfer.username.clone(),
                    transfer.virtual_path.clone(),
                    transfer.local_path.clone(),
                )
            })
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        let opened = path.as_deref().map_or_else(
            || Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
            File::open,
        );
        match opened {
            Ok(file) => {
                self.files.insert(id, file);
                Ok(())
            }
            Err(err) => {
                warn!(transfer_id = %id, error = %err, "cannot open shared file");
                self.send(&username, PeerMessage::UploadFailed { virtual_path });
                self.fail_upload(id)
            }
        }
    }

    pub(super) fn on_file_offset(
        &mut self,
        connection: ConnectionId,
        offset: u64,
    ) -> TransferResult<()> {
        let Some((id, size)) = self
            .uploads
            .find_by_connection(connection)
            .map(|transfer| (transfer.id, transfer.size))
        else {
            debug!(connection = %connection, "offset for unknown upload");
            return Ok(());
        };
        if offset > size {
            warn!(transfer_id = %id, offset, size, "peer asked to resume past end of file");
            self.release(UPLOAD, id);
            self.transition(UPLOAD, id, &NegotiationEvent::Abort)?;
            return Ok(());
        }
        let Some(file) = self.files.get_mut(&id) else {
            return Ok(());
        };
        if let Err(err) = file.seek(SeekFrom::Start(offset)) {
            warn!(transfer_id = %id, error = %err, "cannot seek shared file");
            return self.fail_upload(id);
        }

        self.uploads
            .update(id, |transfer| transfer.begin_progress(offset, Instant::now()));
        self.transition(UPLOAD, id, &NegotiationEvent::DataFlowing)?;
        self.metrics.inc_transfer_started(UPLOAD.as_str());
        debug!(transfer_id = %id, offset, "upload started");

        if size > 0 && offset == size {
            self.finish_upload(id)?;
        }
        Ok(())
    }

    pub(super) fn on_ready_to_send(
        &mut self,
        connection: ConnectionId,
        max_bytes: usize,
    ) -> TransferResult<()> {
        let Some(id) = self
            .uploads
            .find_by_connection(connection)
            .filter(|transfer| *transfer.status() == TransferStatus::Transferring)
            .map(|transfer| transfer.id)
        else {
            return Ok(());
        };
        let Some(file) = self.files.get_mut(&id) else {
            return Ok(());
        };

        let mut chunk = Vec::new();
        let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
        if let Err(err) = Read::by_ref(file).take(limit).read_to_end(&mut chunk) {
            warn!(transfer_id = %id, error = %err, "cannot read shared file");
            return self.fail_upload(id);
        }
        if chunk.is_empty() {
            return Ok(());
        }
        if let Err(err) = self
            .collaborators
            .network
            .send_file_data(connection, chunk)
        {
            debug!(transfer_id = %id, error = %err, "upload connection no longer accepts data");
        }
        Ok(())
    }

    pub(super) fn on_bytes_transferred(
        &mut self,
        connection: ConnectionId,
        byte_count: u64,
    ) -> TransferResult<()> {
        let Some(id) = self
            .uploads
            .find_by_connection(connection)
            .map(|transfer| transfer.id)
        else {
            return Ok(());
        };
        let (offset, size) = self
            .uploads
            .update(id, |transfer| {
                let offset = transfer
                    .current_byte_offset
                    .unwrap_or(0)
                    .saturating_add(byte_count)
                    .min(transfer.size);
                transfer.record_progress(offset, Instant::now());
                (offset, transfer.size)
            })
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        self.metrics
            .add_transferred_bytes(UPLOAD.as_str(), byte_count);

        if offset >= size {
            self.finish_upload(id)
        } else {
            self.publish_progress(UPLOAD, id);
            Ok(())
        }
    }

    fn activate_upload(&mut self, id: TransferId) -> TransferResult<()> {
        self.transition(UPLOAD, id, &NegotiationEvent::Activate)?;
        self.contact_peer(UPLOAD, id)
    }

    fn connect_for_upload(
        &mut self,
        id: TransferId,
        username: &str,
        token: RequestToken,
    ) -> TransferResult<()> {
        if let Err(err) = self
            .collaborators
            .network
            .open_file_connection(username, token)
        {
            warn!(transfer_id = %id, error = %err, "cannot open file connection");
            self.release(UPLOAD, id);
            self.transition(UPLOAD, id, &NegotiationEvent::ConnectFailed)?;
            self.report_upload_failure(id);
            return Ok(());
        }
        self.uploads
            .update(id, |transfer| transfer.request_token = Some(token));
        self.arm_timer(UPLOAD, id, Some(token));
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn finish_upload(&mut self, id: TransferId) -> TransferResult<()> {
        // Leaving the active states resets the sampler.
        let speed = self.uploads.get(id).and_then(Transfer::speed);
        self.transition(UPLOAD, id, &NegotiationEvent::Completed)?;
        self.release(UPLOAD, id);
        if let Some(speed) = speed {
            self.collaborators
                .server
                .send_upload_speed(speed.max(0.0) as u64);
        }
        if self.config.uploads.autoclear_finished {
            self.remove(UPLOAD, id);
        }
        Ok(())
    }

    /// Ask the downloader to re-queue an upload that broke off, unless the
    /// peer is offline.
    pub(super) fn report_upload_failure(&self, id: TransferId) {
        let Some(transfer) = self.uploads.get(id) else {
            return;
        };
        if self.peer(&transfer.username).online == Some(false) {
            return;
        }
        debug!(transfer_id = %id, user = %transfer.username, "reporting failed upload");
        self.send(
            &transfer.username,
            PeerMessage::UploadFailed {
                virtual_path: transfer.virtual_path.clone(),
            },
        );
    }

    fn fail_upload(&mut self, id: TransferId) -> TransferResult<()> {
        self.release(UPLOAD, id);
        self.transition(
            UPLOAD,
            id,
            &NegotiationEvent::LocalFailure(TransferStatus::LocalFileError),
        )?;
        Ok(())
    }

    /// Run the admission checks for a file a peer wants from us.
    ///
    /// Refusals come back as [`TransferError::Rejected`]; a duplicate of a
    /// pending upload as [`TransferError::AlreadyQueued`].
    fn admit(
        &mut self,
        username: &str,
        address: Option<IpAddr>,
        virtual_path: &str,
    ) -> TransferResult<SharedFile> {
        let rejected = |reason| TransferError::Rejected { reason };
        match self.collaborators.filter.check(username, address) {
            Admission::Allowed => {}
            Admission::Banned(message) => {
                self.drop_queued_uploads(username);
                let message = message.or_else(|| self.config.uploads.custom_ban_message.clone());
                return Err(rejected(RejectReason::Banned(message)));
            }
            Admission::Blocked => {
                let message = self.config.uploads.custom_ban_message.clone();
                return Err(rejected(RejectReason::Banned(message)));
            }
        }

        let existing = self
            .uploads
            .find(username, virtual_path)
            .map(|transfer| (transfer.id, transfer.status().clone()));
        if let Some((id, status)) = existing {
            if status.is_active() || status == TransferStatus::Queued {
                return Err(TransferError::AlreadyQueued { transfer_id: id });
            }
            self.remove(UPLOAD, id);
        }

        let shared = self.collaborators.shares.shared_file(username, virtual_path);
        if !self.config.is_exempt_from_limits(username) {
            let tally = self.quota_tally(username);
            let file_limit = self.config.uploads.file_limit;
            if file_limit > 0 && tally.files >= file_limit {
                return Err(rejected(RejectReason::TooManyFiles));
            }
            let size = shared.as_ref().map_or(0, |file| file.size);
            if self
                .config
                .uploads
                .queue_limit_bytes()
                .is_some_and(|limit| tally.bytes.saturating_add(size) > limit)
            {
                return Err(rejected(RejectReason::TooManyMegabytes));
            }
        }

        let shared = shared.ok_or_else(|| rejected(RejectReason::FileNotShared))?;
        if let Err(err) = fs::metadata(&shared.real_path) {
            debug!(path = %shared.real_path.display(), error = %err, "shared file unreadable");
            return Err(rejected(RejectReason::FileReadError));
        }
        Ok(shared)
    }

    fn quota_tally(&self, username: &str) -> Tally {
        let counters = self.uploads.counters(username);
        match self.config.uploads.quota_accounting {
            QuotaAccounting::QueuedOnly => counters.queued,
            QuotaAccounting::QueuedAndActive => Tally {
                files: counters.queued.files.saturating_add(counters.active.files),
                bytes: counters.queued.bytes.saturating_add(counters.active.bytes),
            },
        }
    }

    fn drop_queued_uploads(&mut self, username: &str) {
        let queued: Vec<TransferId> = self
            .uploads
            .iter()
            .filter(|transfer| {
                transfer.username == username && *transfer.status() == TransferStatus::Queued
            })
            .map(|transfer| transfer.id)
            .collect();
        for id in queued {
            self.remove(UPLOAD, id);
        }
    }

    fn deny_upload(&self, username: &str, virtual_path: &str, reason: RejectReason) {
        info!(user = %username, virtual_path = %virtual_path, reason = %reason, "upload denied");
        self.metrics.inc_upload_denied(reason.label());
        self.events.publish(Event::UploadDenied {
            username: username.to_string(),
            virtual_path: virtual_path.to_string(),
            reason: reason.as_text(),
        });
        self.send(
            username,
            PeerMessage::UploadDenied {
                virtual_path: virtual_path.to_string(),
                reason,
            },
        );
    }

    fn respond(
        &self,
        username: &str,
        token: RequestToken,
        outcome: Result<u64, RejectReason>,
    ) {
        let (allowed, reason, size) = match outcome {
            Ok(size) => (true, None, Some(size)),
            Err(reason) => (false, Some(reason), None),
        };
        self.send(
            username,
            PeerMessage::TransferResponse {
                token,
                allowed,
                reason,
                size,
            },
        );
    }

    fn new_upload(
        &mut self,
        username: &str,
        virtual_path: &str,
        shared: SharedFile,
        requested_attributes: FileAttributes,
    ) -> Transfer {
        let SharedFile {
            real_path,
            size,
            file_attributes,
        } = shared;
        let folder = real_path.parent().map(ToOwned::to_owned).unwrap_or_default();
        let attributes = if requested_attributes.is_empty() {
            file_attributes
        } else {
            requested_attributes
        };
        let mut transfer = Transfer::new(
            self.allocate_id(),
            UPLOAD,
            username,
            virtual_path,
            folder,
            Utc::now(),
        )
        .with_size(size)
        .with_attributes(attributes);
        transfer.local_path = Some(real_path);
        transfer
    }

    fn upload_limits_reached(&self) -> bool {
        let settings = &self.config.uploads;
        if settings
            .slot_limit()
            .is_some_and(|limit| self.uploads.active_count() >= limit)
        {
            return true;
        }
        settings.bandwidth_limit_bytes().is_some_and(|limit| {
            let total: f64 = self
                .uploads
                .iter()
                .filter(|transfer| *transfer.status() == TransferStatus::Transferring)
                .filter_map(Transfer::speed)
                .sum();
            #[allow(clippy::cast_precision_loss)]
            let limit = limit as f64;
            total >= limit
        })
    }

    fn upload_negotiating(&self) -> bool {
        self.uploads.iter().any(|transfer| {
            transfer.request_token.is_some()
                || matches!(
                    transfer.status(),
                    TransferStatus::GettingStatus
                        | TransferStatus::GettingAddress
                        | TransferStatus::Connecting
                )
        })
    }

    /// Server privileges plus buddies marked for priority.
    fn effective_privileged_users(&self) -> HashSet<String> {
        let mut privileged = self.privileged_users.clone();
        privileged.extend(
            self.config
                .buddies
                .iter()
                .filter(|buddy| self.config.is_prioritized_buddy(&buddy.username))
                .map(|buddy| buddy.username.clone()),
        );
        privileged
    }

    fn policy_context<'a>(&'a self, privileged: &'a HashSet<String>) -> PolicyContext<'a> {
        PolicyContext {
            mode: self.config.uploads.queue_mode,
            privileged_users: privileged,
            preferred_extensions: &self.config.uploads.preferred_extensions,
            last_served: &self.last_served,
        }
    }
}
