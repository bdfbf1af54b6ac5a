//! Download side of the manager: user operations and the handlers for files
//! peers send to us.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use slsk_events::{TransferDirection, TransferId, TransferStatus};
use slsk_transfer_core::{
    ConnectionId, DownloadRequest, EnqueueOutcome, FinalizeJob, FinalizeOutcome,
    IncomingTransferRequest, NegotiationEvent, PeerMessage, RejectReason, Transfer, TransferError,
    TransferResult,
};
use tracing::{debug, info, warn};

use super::TransferManager;
use crate::paths::{default_download_folder, download_basename, existing_download, incomplete_path};

const DOWNLOAD: TransferDirection = TransferDirection::Download;

impl TransferManager {
    /// Queue a download and start contacting the peer.
    ///
    /// Re-enqueuing a file that is already known reports
    /// [`EnqueueOutcome::AlreadyQueued`] (retrying it when it had stopped);
    /// finished and aborted records are replaced.
    ///
    /// # Errors
    ///
    /// Returns an error only when the new record cannot be created.
    pub fn enqueue_download(&mut self, request: DownloadRequest) -> TransferResult<EnqueueOutcome> {
        let existing = self
            .downloads
            .find(&request.username, &request.virtual_path)
            .map(|transfer| (transfer.id, transfer.status().clone()));
        if let Some((id, status)) = existing {
            if matches!(status, TransferStatus::Finished | TransferStatus::Aborted) {
                self.remove(DOWNLOAD, id);
            } else {
                if !status.is_active() && status != TransferStatus::Queued {
                    self.retry(id)?;
                }
                return Ok(EnqueueOutcome::AlreadyQueued(id));
            }
        }

        let DownloadRequest {
            username,
            virtual_path,
            folder_path,
            size,
            file_attributes,
        } = request;
        let folder = folder_path
            .unwrap_or_else(|| default_download_folder(&self.config.downloads, &username));
        let size = size.unwrap_or(0);
        let filtered = self.is_filtered(&virtual_path);
        let finished_copy = (size > 0 && !filtered)
            .then(|| existing_download(&folder, &download_basename(&virtual_path), size))
            .flatten();

        let id = self.allocate_id();
        let mut transfer = Transfer::new(id, DOWNLOAD, username, virtual_path, folder, Utc::now())
            .with_size(size)
            .with_attributes(file_attributes);
        if filtered {
            transfer.apply(&NegotiationEvent::Filtered)?;
            info!(transfer_id = %id, virtual_path = %transfer.virtual_path, "download filtered");
        } else if let Some(path) = finished_copy {
            info!(transfer_id = %id, path = %path.display(), "download already on disk");
            transfer = transfer
                .with_status(TransferStatus::Finished)
                .with_offset(Some(size));
            transfer.local_path = Some(path);
        }
        let pending = *transfer.status() == TransferStatus::Queued;
        self.insert(transfer);

        if pending {
            if let Err(err) = self.activate_download(id) {
                warn!(transfer_id = %id, error = %err, "failed to start download");
            }
            self.after_event();
        }
        Ok(EnqueueOutcome::Queued(id))
    }

    /// Pause a download, keeping its partial file.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] for unknown downloads.
    pub fn pause(&mut self, id: TransferId) -> TransferResult<()> {
        let status = self.download_status(id)?;
        if matches!(status, TransferStatus::Finished | TransferStatus::Paused)
            || self.finalizing.contains(&id)
        {
            return Ok(());
        }
        self.release(DOWNLOAD, id);
        self.transition(DOWNLOAD, id, &NegotiationEvent::Pause)?;
        self.after_event();
        Ok(())
    }

    /// Put a stopped download back in the queue and contact the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] for unknown downloads.
    pub fn retry(&mut self, id: TransferId) -> TransferResult<()> {
        let status = self.download_status(id)?;
        if status.is_active() || status == TransferStatus::Finished {
            return Ok(());
        }
        self.release(DOWNLOAD, id);
        self.transition(DOWNLOAD, id, &NegotiationEvent::Requeue)?;
        self.activate_download(id)?;
        self.after_event();
        Ok(())
    }

    /// Re-request every download that failed on the network.
    pub fn retry_failed_downloads(&mut self) {
        let failed: Vec<TransferId> = self
            .downloads
            .iter()
            .filter(|transfer| transfer.status().is_retryable())
            .map(|transfer| transfer.id)
            .collect();
        if !failed.is_empty() {
            debug!(count = failed.len(), "retrying failed downloads");
        }
        for id in failed {
            if let Err(err) = self.activate_download(id) {
                warn!(transfer_id = %id, error = %err, "download retry failed");
            }
        }
        self.after_event();
    }

    /// Ask online uploaders where our queued downloads stand.
    pub fn request_queue_positions(&self) {
        for transfer in self.downloads.iter() {
            if *transfer.status() == TransferStatus::Queued
                && self.peer(&transfer.username).online == Some(true)
            {
                self.send(
                    &transfer.username,
                    PeerMessage::PlaceInQueueRequest {
                        virtual_path: transfer.virtual_path.clone(),
                    },
                );
            }
        }
    }

    pub(super) fn activate_download(&mut self, id: TransferId) -> TransferResult<()> {
        self.transition(DOWNLOAD, id, &NegotiationEvent::Activate)?;
        self.contact_peer(DOWNLOAD, id)
    }

    pub(super) fn delete_partial(&self, id: TransferId) {
        let Some(transfer) = self.downloads.get(id) else {
            return;
        };
        let path = self.incomplete_file(transfer);
        match fs::remove_file(&path) {
            Ok(()) => info!(transfer_id = %id, path = %path.display(), "partial download deleted"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(transfer_id = %id, path = %path.display(), error = %err, "failed to delete partial download");
            }
        }
    }

    /// The uploader is ready to send a file we queued.
    pub(super) fn on_upload_offer(&mut self, request: IncomingTransferRequest) -> TransferResult<()> {
        let IncomingTransferRequest {
            username,
            token,
            virtual_path,
            size,
            ..
        } = request;
        let found = self
            .downloads
            .find(&username, &virtual_path)
            .map(|transfer| (transfer.id, transfer.status().clone()));

        let refusal = match &found {
            None => Some(RejectReason::Cancelled),
            Some((_, TransferStatus::Finished)) => Some(RejectReason::Complete),
            Some((
                _,
                TransferStatus::Paused
                | TransferStatus::Aborted
                | TransferStatus::Filtered
                | TransferStatus::Transferring,
            )) => Some(RejectReason::Cancelled),
            Some((_, status)) if status.is_local_failure() => Some(RejectReason::Cancelled),
            Some(_) => None,
        };
        if let Some(reason) = refusal {
            debug!(user = %username, virtual_path = %virtual_path, reason = %reason, "refusing upload offer");
            self.send(
                &username,
                PeerMessage::TransferResponse {
                    token,
                    allowed: false,
                    reason: Some(reason),
                    size: None,
                },
            );
            return Ok(());
        }
        let Some((id, _)) = found else {
            return Ok(());
        };

        self.release(DOWNLOAD, id);
        self.downloads.update(id, |transfer| {
            if let Some(size) = size {
                transfer.size = size;
            }
            transfer.request_token = Some(token);
            transfer.queue_position = None;
        });
        self.transition(
            DOWNLOAD,
            id,
            &NegotiationEvent::IncomingAccepted { we_connect: false },
        )?;
        self.send(
            &username,
            PeerMessage::TransferResponse {
                token,
                allowed: true,
                reason: None,
                size: None,
            },
        );
        self.arm_timer(DOWNLOAD, id, Some(token));
        Ok(())
    }

    pub(super) fn on_place_in_queue_response(
        &mut self,
        username: &str,
        virtual_path: &str,
        place: u32,
    ) -> TransferResult<()> {
        let Some(id) = self
            .downloads
            .find(username, virtual_path)
            .map(|transfer| transfer.id)
        else {
            return Ok(());
        };
        self.downloads
            .update(id, |transfer| transfer.queue_position = Some(place));
        self.publish_update(DOWNLOAD, id);
        Ok(())
    }

    pub(super) fn on_queue_failed(
        &mut self,
        username: &str,
        virtual_path: &str,
        reason: &str,
    ) -> TransferResult<()> {
        let Some((id, status)) = self
            .downloads
            .find(username, virtual_path)
            .map(|transfer| (transfer.id, transfer.status().clone()))
        else {
            return Ok(());
        };
        if matches!(
            status,
            TransferStatus::Paused
                | TransferStatus::Aborted
                | TransferStatus::Finished
                | TransferStatus::Filtered
        ) {
            return Ok(());
        }

        let reason = RejectReason::parse(reason);
        info!(user = %username, virtual_path = %virtual_path, reason = %reason, "uploader refused download");
        self.release(DOWNLOAD, id);
        self.transition(
            DOWNLOAD,
            id,
            &NegotiationEvent::Rejected(reason.download_status()),
        )?;
        Ok(())
    }

    pub(super) fn on_remote_upload_failed(
        &mut self,
        username: &str,
        virtual_path: &str,
    ) -> TransferResult<()> {
        let Some((id, status)) = self
            .downloads
            .find(username, virtual_path)
            .map(|transfer| (transfer.id, transfer.status().clone()))
        else {
            return Ok(());
        };
        if !status.is_active() && status != TransferStatus::Queued {
            return Ok(());
        }
        self.release(DOWNLOAD, id);
        self.transition(
            DOWNLOAD,
            id,
            &NegotiationEvent::Rejected(TransferStatus::RemoteFileError),
        )?;
        Ok(())
    }

    /// The uploader connected: open the partial file and tell it where to resume.
    pub(super) fn attach_download(
        &mut self,
        id: TransferId,
        connection: ConnectionId,
    ) -> TransferResult<()> {
        self.disarm(DOWNLOAD, id);
        self.downloads.update(id, |transfer| {
            transfer.request_token = None;
            transfer.connection = Some(connection);
        });
        self.transition(DOWNLOAD, id, &NegotiationEvent::FileConnected)?;

        let (path, size) = self
            .downloads
            .get(id)
            .map(|transfer| (self.incomplete_file(transfer), transfer.size))
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        let (file, offset) = match open_incomplete(&path) {
            Ok(opened) => opened,
            Err(err) => {
                warn!(transfer_id = %id, error = %err, "cannot open incomplete file");
                self.release(DOWNLOAD, id);
                self.transition(
                    DOWNLOAD,
                    id,
                    &NegotiationEvent::LocalFailure(TransferStatus::LocalFileError),
                )?;
                return Ok(());
            }
        };

        self.files.insert(id, file);
        self.downloads.update(id, |transfer| {
            transfer.local_path = Some(path);
            transfer.begin_progress(offset, Instant::now());
        });
        if let Err(err) = self
            .collaborators
            .network
            .send_file_offset(connection, offset)
        {
            warn!(transfer_id = %id, error = %err, "failed to send file offset");
            self.release(DOWNLOAD, id);
            self.transition(
                DOWNLOAD,
                id,
                &NegotiationEvent::ConnectionLost {
                    peer_offline: false,
                },
            )?;
            return Ok(());
        }
        debug!(transfer_id = %id, offset, "download resuming");

        if offset >= size {
            self.complete_download(id)?;
        }
        Ok(())
    }

    pub(super) fn on_bytes_received(
        &mut self,
        connection: ConnectionId,
        chunk: &[u8],
    ) -> TransferResult<()> {
        let Some((id, status)) = self
            .downloads
            .find_by_connection(connection)
            .map(|transfer| (transfer.id, transfer.status().clone()))
        else {
            debug!(connection = %connection, "bytes for unknown download");
            return Ok(());
        };
        let Some(file) = self.files.get_mut(&id) else {
            return Ok(());
        };
        if let Err(err) = file.write_all(chunk) {
            warn!(transfer_id = %id, error = %err, "download write failed");
            self.release(DOWNLOAD, id);
            self.transition(
                DOWNLOAD,
                id,
                &NegotiationEvent::LocalFailure(TransferStatus::LocalFileError),
            )?;
            return Ok(());
        }

        if status != TransferStatus::Transferring {
            self.transition(DOWNLOAD, id, &NegotiationEvent::DataFlowing)?;
            self.metrics.inc_transfer_started(DOWNLOAD.as_str());
        }
        let received = u64::try_from(chunk.len()).unwrap_or(u64::MAX);
        let (offset, size) = self
            .downloads
            .update(id, |transfer| {
                let offset = transfer
                    .current_byte_offset
                    .unwrap_or(0)
                    .saturating_add(received);
                transfer.record_progress(offset, Instant::now());
                (offset, transfer.size)
            })
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        self.metrics
            .add_transferred_bytes(DOWNLOAD.as_str(), received);

        if offset >= size {
            self.complete_download(id)
        } else {
            self.publish_progress(DOWNLOAD, id);
            Ok(())
        }
    }

    /// All bytes are on disk; hand the move to the job runner.
    fn complete_download(&mut self, id: TransferId) -> TransferResult<()> {
        self.files.remove(&id);
        let connection = self
            .downloads
            .update(id, |transfer| transfer.connection.take())
            .flatten();
        if let Some(connection) = connection {
            self.collaborators.network.close_connection(connection);
        }

        let job = self
            .downloads
            .get(id)
            .map(|transfer| FinalizeJob {
                transfer_id: id,
                incomplete_path: self.incomplete_file(transfer),
                folder_path: transfer.folder_path.clone(),
                basename: download_basename(&transfer.virtual_path),
            })
            .ok_or(TransferError::NotFound { transfer_id: id })?;
        debug!(transfer_id = %id, "download complete; finalizing");
        self.finalizing.insert(id);
        self.collaborators.jobs.submit(job);
        Ok(())
    }

    pub(super) fn on_download_finalized(
        &mut self,
        id: TransferId,
        outcome: FinalizeOutcome,
    ) -> TransferResult<()> {
        self.finalizing.remove(&id);
        if !self.downloads.contains(id) {
            debug!(transfer_id = %id, "finalized download was cleared meanwhile");
            return Ok(());
        }
        match outcome {
            FinalizeOutcome::Moved { final_path } => {
                self.transition(DOWNLOAD, id, &NegotiationEvent::Completed)?;
                self.downloads
                    .update(id, |transfer| transfer.local_path = Some(final_path));
                if self.config.downloads.autoclear_finished {
                    self.remove(DOWNLOAD, id);
                }
            }
            FinalizeOutcome::Failed { message } => {
                warn!(transfer_id = %id, error = %message, "cannot move download into place");
                self.transition(
                    DOWNLOAD,
                    id,
                    &NegotiationEvent::LocalFailure(TransferStatus::DownloadFolderError),
                )?;
            }
        }
        Ok(())
    }

    fn download_status(&self, id: TransferId) -> TransferResult<TransferStatus> {
        self.downloads
            .get(id)
            .map(|transfer| transfer.status().clone())
            .ok_or(TransferError::NotFound { transfer_id: id })
    }

    fn incomplete_file(&self, transfer: &Transfer) -> PathBuf {
        incomplete_path(
            &self.config.downloads.incomplete_dir,
            &transfer.username,
            &transfer.virtual_path,
        )
    }

    fn is_filtered(&self, virtual_path: &str) -> bool {
        self.download_filters
            .iter()
            .any(|filter| filter.is_match(virtual_path))
    }
}

/// Open (or create) a partial file for appending; its length is the resume
/// offset.
fn open_incomplete(path: &Path) -> TransferResult<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|source| TransferError::io("download.create_incomplete_dir", parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TransferError::io("download.open_incomplete", path, source))?;
    let offset = file
        .metadata()
        .map_err(|source| TransferError::io("download.stat_incomplete", path, source))?
        .len();
    Ok((file, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    #[test]
    fn incomplete_file_resumes_from_length() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("INCOMPLETEabc");
        let (mut file, offset) = open_incomplete(&path)?;
        assert_eq!(offset, 0);
        file.write_all(b"12345")?;
        drop(file);

        let (_, offset) = open_incomplete(&path)?;
        assert_eq!(offset, 5);
        Ok(())
    }
}
