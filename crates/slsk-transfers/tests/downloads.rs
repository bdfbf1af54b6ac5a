mod common;

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use common::Harness;
use slsk_config::DownloadFilter;
use slsk_events::{TransferDirection, TransferId, TransferStatus};
use slsk_test_support::fakes::NetworkCall;
use slsk_transfer_core::{
    ConnectionId, DownloadRequest, EnqueueOutcome, FinalizeOutcome, IncomingTransferRequest,
    NetworkEvent, PeerMessage, RejectReason, RequestToken, TimerEvent,
};
use slsk_transfers::paths::{finalize_download, incomplete_path};
use slsk_transfers::{StoredTransfer, TransferStore};

const PEER: &str = "alice";
const SONG: &str = "Music\\Album\\01 - Song.mp3";

fn request(size: u64) -> DownloadRequest {
    DownloadRequest {
        size: Some(size),
        ..DownloadRequest::new(PEER, SONG)
    }
}

fn offer(token: u32, size: u64) -> NetworkEvent {
    NetworkEvent::TransferRequest(IncomingTransferRequest {
        username: PEER.into(),
        address: None,
        direction: TransferDirection::Upload,
        token: RequestToken(token),
        virtual_path: SONG.into(),
        size: Some(size),
    })
}

#[test]
fn download_runs_from_enqueue_to_finished_file() -> Result<()> {
    let mut harness = Harness::new()?;
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();

    assert_eq!(harness.status(id), Some(TransferStatus::GettingStatus));
    assert_eq!(harness.fakes.server.watched(), vec![PEER.to_string()]);
    assert_eq!(harness.fakes.scheduler.pending().len(), 1);

    harness.peer_reachable(PEER);
    assert_eq!(harness.status(id), Some(TransferStatus::Queued));
    assert_eq!(
        harness.fakes.network.messages_to(PEER),
        vec![PeerMessage::QueueUpload {
            virtual_path: SONG.into()
        }]
    );
    assert!(harness.fakes.scheduler.pending().is_empty());

    harness.manager.handle_network_event(offer(77, 6));
    assert_eq!(harness.status(id), Some(TransferStatus::WaitingForConnection));
    assert!(harness.fakes.network.messages_to(PEER).contains(&PeerMessage::TransferResponse {
        token: RequestToken(77),
        allowed: true,
        reason: None,
        size: None,
    }));

    let connection = ConnectionId(5);
    harness
        .manager
        .handle_network_event(NetworkEvent::FileConnectionEstablished {
            username: PEER.into(),
            token: RequestToken(77),
            connection,
        });
    assert_eq!(harness.status(id), Some(TransferStatus::Negotiating));
    assert!(harness.fakes.network.calls().contains(&NetworkCall::FileOffset {
        connection,
        offset: 0
    }));

    for chunk in [&b"abc"[..], &b"def"[..]] {
        harness
            .manager
            .handle_network_event(NetworkEvent::BytesReceived {
                connection,
                chunk: chunk.to_vec(),
            });
    }
    assert_eq!(harness.status(id), Some(TransferStatus::Transferring));
    assert!(harness.fakes.network.closed().contains(&connection));

    let jobs = harness.fakes.jobs.take_jobs();
    assert_eq!(jobs.len(), 1);
    let outcome = finalize_download(&jobs[0]);
    harness.manager.handle_finalized(id, outcome);

    let transfer = harness.manager.transfer(id).context("download kept")?;
    assert_eq!(*transfer.status(), TransferStatus::Finished);
    let final_path = transfer.local_path().context("final path recorded")?;
    assert_eq!(final_path, harness.workspace.download_dir().join("01 - Song.mp3"));
    assert_eq!(fs::read(final_path)?, b"abcdef");
    Ok(())
}

/// Drive a 6-byte download until every byte is written and the move is queued.
fn receive_everything(harness: &mut Harness) -> Result<TransferId> {
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();
    harness.peer_reachable(PEER);
    harness.manager.handle_network_event(offer(31, 6));
    let connection = ConnectionId(8);
    harness
        .manager
        .handle_network_event(NetworkEvent::FileConnectionEstablished {
            username: PEER.into(),
            token: RequestToken(31),
            connection,
        });
    harness
        .manager
        .handle_network_event(NetworkEvent::BytesReceived {
            connection,
            chunk: b"abcdef".to_vec(),
        });
    Ok(id)
}

#[test]
fn finalizing_download_ignores_abort_pause_and_logoff() -> Result<()> {
    let mut harness = Harness::new()?;
    let id = receive_everything(&mut harness)?;
    let jobs = harness.fakes.jobs.take_jobs();
    assert_eq!(jobs.len(), 1);

    harness
        .manager
        .abort(TransferDirection::Download, id, true)?;
    harness.manager.pause(id)?;
    harness.peer_offline(PEER);
    assert_eq!(harness.status(id), Some(TransferStatus::Transferring));
    assert!(jobs[0].incomplete_path.exists());

    harness.manager.handle_finalized(id, finalize_download(&jobs[0]));
    assert_eq!(harness.status(id), Some(TransferStatus::Finished));
    let final_path = harness.workspace.download_dir().join("01 - Song.mp3");
    assert_eq!(fs::read(&final_path)?, b"abcdef");

    harness
        .manager
        .abort(TransferDirection::Download, id, false)?;
    assert_eq!(harness.status(id), Some(TransferStatus::Finished));
    Ok(())
}

#[test]
fn failed_move_keeps_no_final_path() -> Result<()> {
    let mut harness = Harness::new()?;
    let id = receive_everything(&mut harness)?;
    assert_eq!(harness.fakes.jobs.take_jobs().len(), 1);

    harness.manager.handle_finalized(
        id,
        FinalizeOutcome::Failed {
            message: "disk full".into(),
        },
    );
    let transfer = harness.manager.transfer(id).context("download kept")?;
    assert_eq!(*transfer.status(), TransferStatus::DownloadFolderError);
    assert!(
        transfer
            .local_path()
            .is_none_or(|path| !path.starts_with(harness.workspace.download_dir()))
    );
    Ok(())
}

#[test]
fn download_cleared_while_finalizing_stays_gone() -> Result<()> {
    let mut harness = Harness::new()?;
    let id = receive_everything(&mut harness)?;
    let jobs = harness.fakes.jobs.take_jobs();

    harness.manager.clear(TransferDirection::Download, id)?;
    harness.manager.handle_finalized(id, finalize_download(&jobs[0]));
    assert!(harness.manager.transfer(id).is_none());
    Ok(())
}

#[test]
fn partial_file_resumes_from_its_length() -> Result<()> {
    let mut harness = Harness::new()?;
    let partial = incomplete_path(&harness.workspace.incomplete_dir(), PEER, SONG);
    fs::write(&partial, b"abcd")?;

    harness.peer_reachable(PEER);
    let id = harness.manager.enqueue_download(request(10))?.transfer_id();
    harness.manager.handle_network_event(offer(3, 10));
    harness
        .manager
        .handle_network_event(NetworkEvent::FileConnectionEstablished {
            username: PEER.into(),
            token: RequestToken(3),
            connection: ConnectionId(1),
        });

    assert!(harness.fakes.network.calls().contains(&NetworkCall::FileOffset {
        connection: ConnectionId(1),
        offset: 4
    }));
    assert_eq!(harness.status(id), Some(TransferStatus::Negotiating));
    Ok(())
}

#[test]
fn unanswered_status_request_times_out_and_retries() -> Result<()> {
    let mut harness = Harness::new()?;
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();

    let pending = harness.fakes.scheduler.pending();
    assert_eq!(
        pending,
        vec![TimerEvent::RequestTimeout {
            transfer_id: id,
            token: None
        }]
    );
    harness.fire_timers();
    assert_eq!(harness.status(id), Some(TransferStatus::CannotConnect));

    harness.manager.retry_failed_downloads();
    assert_eq!(harness.status(id), Some(TransferStatus::GettingStatus));
    Ok(())
}

#[test]
fn stale_timer_does_not_touch_a_moved_on_download() -> Result<()> {
    let mut harness = Harness::new()?;
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();
    let stale = harness.fakes.scheduler.pending();

    harness.peer_reachable(PEER);
    harness.manager.handle_network_event(offer(9, 6));
    for event in stale {
        harness.manager.handle_timer(event);
    }
    assert_eq!(harness.status(id), Some(TransferStatus::WaitingForConnection));
    Ok(())
}

#[test]
fn offline_peer_parks_download_until_it_returns() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.peer_reachable(PEER);
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();
    assert_eq!(harness.status(id), Some(TransferStatus::Queued));

    harness.peer_offline(PEER);
    assert_eq!(harness.status(id), Some(TransferStatus::UserLoggedOff));

    harness.peer_reachable(PEER);
    assert_eq!(harness.status(id), Some(TransferStatus::Queued));
    Ok(())
}

#[test]
fn enqueue_twice_reports_existing_transfer() -> Result<()> {
    let mut harness = Harness::new()?;
    let first = harness.manager.enqueue_download(request(6))?;
    let second = harness.manager.enqueue_download(request(6))?;
    assert!(matches!(first, EnqueueOutcome::Queued(_)));
    assert_eq!(second, EnqueueOutcome::AlreadyQueued(first.transfer_id()));
    assert_eq!(harness.manager.transfers(TransferDirection::Download).count(), 1);
    Ok(())
}

#[test]
fn matching_filter_marks_download_filtered() -> Result<()> {
    let mut harness = Harness::with_config(|config| {
        config.downloads.enable_filters = true;
        config.downloads.filters = vec![DownloadFilter {
            pattern: "*.mp3".into(),
            escaped: true,
        }];
    })?;
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();
    assert_eq!(harness.status(id), Some(TransferStatus::Filtered));
    assert!(harness.fakes.server.watched().is_empty());
    Ok(())
}

#[test]
fn existing_copy_with_same_size_finishes_immediately() -> Result<()> {
    let mut harness = Harness::new()?;
    fs::write(harness.workspace.download_dir().join("01 - Song.mp3"), b"abcdef")?;
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();
    assert_eq!(harness.status(id), Some(TransferStatus::Finished));
    assert!(harness.fakes.network.calls().is_empty());
    Ok(())
}

#[test]
fn queue_failure_maps_reason_to_status() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.peer_reachable(PEER);
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();

    harness
        .manager
        .handle_network_event(NetworkEvent::QueueFailed {
            username: PEER.into(),
            virtual_path: SONG.into(),
            reason: "File not shared.".into(),
        });
    assert_eq!(harness.status(id), Some(TransferStatus::FileNotShared));
    Ok(())
}

#[test]
fn offers_for_paused_or_unknown_files_are_refused() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.peer_reachable(PEER);
    let id = harness.manager.enqueue_download(request(6))?.transfer_id();
    harness.manager.pause(id)?;
    harness.manager.pause(id)?;
    assert_eq!(harness.status(id), Some(TransferStatus::Paused));

    harness.manager.handle_network_event(offer(11, 6));
    assert!(harness.fakes.network.messages_to(PEER).contains(&PeerMessage::TransferResponse {
        token: RequestToken(11),
        allowed: false,
        reason: Some(RejectReason::Cancelled),
        size: None,
    }));
    assert_eq!(harness.status(id), Some(TransferStatus::Paused));
    Ok(())
}

#[test]
fn abort_is_idempotent_and_deletes_partial_on_request() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.peer_reachable(PEER);
    let id = harness.manager.enqueue_download(request(10))?.transfer_id();
    harness.manager.handle_network_event(offer(4, 10));
    harness
        .manager
        .handle_network_event(NetworkEvent::FileConnectionEstablished {
            username: PEER.into(),
            token: RequestToken(4),
            connection: ConnectionId(2),
        });
    harness
        .manager
        .handle_network_event(NetworkEvent::BytesReceived {
            connection: ConnectionId(2),
            chunk: b"abc".to_vec(),
        });
    let partial = incomplete_path(&harness.workspace.incomplete_dir(), PEER, SONG);
    assert!(partial.exists());

    harness.manager.abort(TransferDirection::Download, id, true)?;
    harness.manager.abort(TransferDirection::Download, id, true)?;
    assert_eq!(harness.status(id), Some(TransferStatus::Aborted));
    assert!(!partial.exists());
    assert_eq!(harness.fakes.network.closed(), vec![ConnectionId(2)]);

    // Late network events for the closed connection change nothing.
    harness
        .manager
        .handle_network_event(NetworkEvent::ConnectionClosed {
            connection: ConnectionId(2),
        });
    assert_eq!(harness.status(id), Some(TransferStatus::Aborted));
    Ok(())
}

#[test]
fn lost_connection_mid_transfer_is_retryable() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.peer_reachable(PEER);
    let id = harness.manager.enqueue_download(request(10))?.transfer_id();
    harness.manager.handle_network_event(offer(4, 10));
    harness
        .manager
        .handle_network_event(NetworkEvent::FileConnectionEstablished {
            username: PEER.into(),
            token: RequestToken(4),
            connection: ConnectionId(2),
        });
    harness
        .manager
        .handle_network_event(NetworkEvent::ConnectionClosed {
            connection: ConnectionId(2),
        });
    assert_eq!(harness.status(id), Some(TransferStatus::ConnectionClosed));
    assert!(harness.fakes.network.closed().is_empty());
    Ok(())
}

#[test]
fn restart_normalizes_in_flight_downloads() -> Result<()> {
    let harness = Harness::new()?;
    let store = TransferStore::new(harness.manager.config().downloads_file());
    let row = |path: &str, status: TransferStatus, offset: Option<u64>| StoredTransfer {
        username: PEER.into(),
        virtual_path: path.into(),
        folder_path: harness.workspace.download_dir().display().to_string(),
        status,
        size: 10,
        current_byte_offset: offset,
        file_attributes: slsk_transfer_core::FileAttributes::new(),
    };
    store.save(&[
        row("a\\transferring.mp3", TransferStatus::Transferring, Some(3)),
        row("a\\complete.mp3", TransferStatus::Transferring, Some(10)),
        row("a\\aborted.mp3", TransferStatus::Aborted, None),
        row("a\\queued.mp3", TransferStatus::Queued, None),
    ])?;

    let mut restarted = Harness::with_config(|config| {
        config.data_dir = harness.manager.config().data_dir.clone();
    })?;
    restarted
        .manager
        .restore(TransferDirection::Download, store.load()?);
    let statuses: Vec<(String, TransferStatus)> = restarted
        .manager
        .transfers(TransferDirection::Download)
        .map(|transfer| (transfer.virtual_path.clone(), transfer.status().clone()))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("a\\transferring.mp3".into(), TransferStatus::UserLoggedOff),
            ("a\\complete.mp3".into(), TransferStatus::Finished),
            ("a\\aborted.mp3".into(), TransferStatus::Paused),
            ("a\\queued.mp3".into(), TransferStatus::UserLoggedOff),
        ]
    );

    restarted.manager.start();
    let watched = restarted.fakes.server.watched();
    assert_eq!(watched.len(), 2);

    let saved = restarted.manager.persisted(TransferDirection::Download);
    assert_eq!(saved.len(), 4);
    Ok(())
}

#[test]
fn clear_finished_drops_only_finished_rows() -> Result<()> {
    let mut harness = Harness::new()?;
    fs::write(harness.workspace.download_dir().join("01 - Song.mp3"), b"abcdef")?;
    let done = harness.manager.enqueue_download(request(6))?.transfer_id();
    let pending = harness
        .manager
        .enqueue_download(DownloadRequest {
            folder_path: Some(PathBuf::from(harness.workspace.path())),
            ..DownloadRequest::new(PEER, "Music\\other.mp3")
        })?
        .transfer_id();

    harness.manager.clear_finished(TransferDirection::Download);
    assert!(harness.manager.transfer(done).is_none());
    assert!(harness.manager.transfer(pending).is_some());
    Ok(())
}
