mod common;

use std::time::Duration;

use anyhow::{Context, Result};
use common::{Harness, tick};
use slsk_config::{Buddy, QueueMode, QuotaAccounting};
use slsk_events::{Event, TransferDirection, TransferId, TransferStatus};
use slsk_test_support::fakes::NetworkCall;
use slsk_transfer_core::{
    ConnectionId, IncomingTransferRequest, IncomingTransferResponse, NetworkEvent, PeerMessage,
    RejectReason, RequestToken,
};
use tokio::time::timeout;

const BOB: &str = "bob";
const SONG: &str = "Share\\song.flac";

fn denials(harness: &Harness, username: &str) -> Vec<RejectReason> {
    harness
        .fakes
        .network
        .messages_to(username)
        .into_iter()
        .filter_map(|message| match message {
            PeerMessage::UploadDenied { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}

/// The upload currently being negotiated or sent.
fn active_upload(harness: &Harness) -> Option<TransferId> {
    harness
        .manager
        .transfers(TransferDirection::Upload)
        .find(|transfer| transfer.status().is_active())
        .map(|transfer| transfer.id)
}

#[test]
fn queued_upload_is_negotiated_and_sent() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.share(SONG, b"abcdef")?;
    harness.peer_reachable(BOB);
    harness.queue_upload(BOB, SONG);

    let id = harness.upload_id(BOB, SONG).context("upload queued")?;
    assert_eq!(harness.status(id), Some(TransferStatus::Requesting));
    let token = harness.last_request_token(BOB).context("request sent")?;

    harness.answer(BOB, token, true);
    assert_eq!(harness.status(id), Some(TransferStatus::Negotiating));
    assert!(harness.fakes.network.calls().contains(&NetworkCall::OpenFileConnection {
        username: BOB.into(),
        token,
    }));

    let connection = ConnectionId(9);
    harness
        .manager
        .handle_network_event(NetworkEvent::FileConnectionEstablished {
            username: BOB.into(),
            token,
            connection,
        });
    harness
        .manager
        .handle_network_event(NetworkEvent::FileOffset {
            connection,
            offset: 0,
        });
    assert_eq!(harness.status(id), Some(TransferStatus::Transferring));

    for written in [4, 2] {
        harness
            .manager
            .handle_network_event(NetworkEvent::ReadyToSend {
                connection,
                max_bytes: 4,
            });
        harness
            .manager
            .handle_network_event(NetworkEvent::BytesTransferred {
                connection,
                byte_count: written,
            });
    }

    let data: Vec<u8> = harness
        .fakes
        .network
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NetworkCall::FileData { data, .. } => Some(data),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(data, b"abcdef");
    assert_eq!(harness.status(id), Some(TransferStatus::Finished));
    assert!(harness.fakes.network.closed().contains(&connection));
    assert_eq!(harness.manager.persisted(TransferDirection::Upload).len(), 1);
    Ok(())
}

/// Queue `SONG` for `BOB`, accept it and open its file connection at offset 0.
fn start_sending(harness: &mut Harness, connection: ConnectionId) -> Result<TransferId> {
    harness.share(SONG, b"abcdef")?;
    harness.peer_reachable(BOB);
    harness.queue_upload(BOB, SONG);
    let id = harness.upload_id(BOB, SONG).context("upload queued")?;
    let token = harness.last_request_token(BOB).context("request sent")?;
    harness.answer(BOB, token, true);
    harness
        .manager
        .handle_network_event(NetworkEvent::FileConnectionEstablished {
            username: BOB.into(),
            token,
            connection,
        });
    harness
        .manager
        .handle_network_event(NetworkEvent::FileOffset {
            connection,
            offset: 0,
        });
    Ok(id)
}

fn send_chunk(harness: &mut Harness, connection: ConnectionId, byte_count: u64) {
    harness
        .manager
        .handle_network_event(NetworkEvent::ReadyToSend {
            connection,
            max_bytes: 4,
        });
    harness
        .manager
        .handle_network_event(NetworkEvent::BytesTransferred {
            connection,
            byte_count,
        });
}

#[test]
fn finished_upload_reports_its_speed() -> Result<()> {
    let mut harness = Harness::new()?;
    let connection = ConnectionId(4);
    let id = start_sending(&mut harness, connection)?;

    tick();
    send_chunk(&mut harness, connection, 4);
    tick();
    send_chunk(&mut harness, connection, 2);

    assert_eq!(harness.status(id), Some(TransferStatus::Finished));
    let speeds = harness.fakes.server.upload_speeds();
    assert_eq!(speeds.len(), 1);
    assert!(speeds[0] > 0);
    Ok(())
}

#[test]
fn dropped_upload_connection_asks_peer_to_requeue() -> Result<()> {
    let mut harness = Harness::new()?;
    let connection = ConnectionId(5);
    let id = start_sending(&mut harness, connection)?;
    send_chunk(&mut harness, connection, 2);

    harness
        .manager
        .handle_network_event(NetworkEvent::ConnectionClosed { connection });

    assert_eq!(harness.status(id), Some(TransferStatus::ConnectionClosed));
    assert!(harness.fakes.network.messages_to(BOB).contains(&PeerMessage::UploadFailed {
        virtual_path: SONG.into(),
    }));
    assert!(harness.fakes.server.upload_speeds().is_empty());
    Ok(())
}

#[test]
fn upload_to_departed_peer_is_not_reported() -> Result<()> {
    let mut harness = Harness::new()?;
    let connection = ConnectionId(6);
    let id = start_sending(&mut harness, connection)?;
    send_chunk(&mut harness, connection, 2);

    harness.peer_offline(BOB);
    harness
        .manager
        .handle_network_event(NetworkEvent::ConnectionClosed { connection });

    assert_eq!(harness.status(id), Some(TransferStatus::UserLoggedOff));
    assert!(
        !harness
            .fakes
            .network
            .messages_to(BOB)
            .iter()
            .any(|message| matches!(message, PeerMessage::UploadFailed { .. }))
    );
    Ok(())
}

#[test]
fn unanswered_request_fails_with_cannot_connect() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.share(SONG, b"abcdef")?;
    harness.peer_reachable(BOB);
    harness.queue_upload(BOB, SONG);
    let id = harness.upload_id(BOB, SONG).context("upload queued")?;

    harness.fire_timers();
    assert_eq!(harness.status(id), Some(TransferStatus::CannotConnect));
    assert!(harness.manager.persisted(TransferDirection::Upload).is_empty());
    assert!(harness.fakes.network.messages_to(BOB).contains(&PeerMessage::UploadFailed {
        virtual_path: SONG.into(),
    }));
    Ok(())
}

#[test]
fn refusals_abort_or_reject_by_reason() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.share(SONG, b"abcdef")?;
    harness.share("Share\\other.flac", b"xyz")?;
    harness.peer_reachable(BOB);

    harness.queue_upload(BOB, SONG);
    let first = harness.upload_id(BOB, SONG).context("first queued")?;
    let token = harness.last_request_token(BOB).context("first request")?;
    harness.answer(BOB, token, false);
    assert_eq!(harness.status(first), Some(TransferStatus::Aborted));

    harness.queue_upload(BOB, "Share\\other.flac");
    let second = harness
        .upload_id(BOB, "Share\\other.flac")
        .context("second queued")?;
    let token = harness.last_request_token(BOB).context("second request")?;
    harness
        .manager
        .handle_network_event(NetworkEvent::TransferResponse(IncomingTransferResponse {
            username: BOB.into(),
            token,
            allowed: false,
            reason: Some(RejectReason::Other("Not today".into())),
            size: None,
        }));
    assert_eq!(
        harness.status(second),
        Some(TransferStatus::Rejected("Not today".into()))
    );
    Ok(())
}

#[test]
fn round_robin_serves_every_user_before_repeating() -> Result<()> {
    let mut harness = Harness::new()?;
    for (user, path) in [
        ("alice", "a\\1.mp3"),
        ("alice", "a\\2.mp3"),
        ("bob", "b\\1.mp3"),
        ("carol", "c\\1.mp3"),
    ] {
        harness.share(path, b"data")?;
        harness.queue_upload(user, path);
        tick();
    }

    let mut served = Vec::new();
    for _ in 0..4 {
        let id = active_upload(&harness).context("an upload is being negotiated")?;
        let transfer = harness.manager.transfer(id).context("known upload")?;
        served.push(format!("{}:{}", transfer.username, transfer.virtual_path));
        tick();
        harness.fire_timers();
        tick();
    }
    assert_eq!(
        served,
        vec!["alice:a\\1.mp3", "bob:b\\1.mp3", "carol:c\\1.mp3", "alice:a\\2.mp3"]
    );
    Ok(())
}

#[test]
fn fifo_serves_files_in_arrival_order() -> Result<()> {
    let mut harness = Harness::with_config(|config| {
        config.uploads.queue_mode = QueueMode::Fifo;
    })?;
    for (user, path) in [
        ("alice", "a\\1.mp3"),
        ("alice", "a\\2.mp3"),
        ("bob", "b\\1.mp3"),
    ] {
        harness.share(path, b"data")?;
        harness.queue_upload(user, path);
        tick();
    }

    let mut served = Vec::new();
    for _ in 0..3 {
        let id = active_upload(&harness).context("an upload is being negotiated")?;
        served.push(harness.manager.transfer(id).context("known")?.virtual_path.clone());
        harness.fire_timers();
        tick();
    }
    assert_eq!(served, vec!["a\\1.mp3", "a\\2.mp3", "b\\1.mp3"]);
    Ok(())
}

#[test]
fn privileged_users_jump_the_queue() -> Result<()> {
    let mut harness = Harness::new()?;
    for (user, path) in [("alice", "a\\1.mp3"), ("bob", "b\\1.mp3"), ("carol", "c\\1.mp3")] {
        harness.share(path, b"data")?;
        harness.queue_upload(user, path);
        tick();
    }
    harness.manager.set_privileged_users(vec!["carol".to_string()]);
    let carol = harness.upload_id("carol", "c\\1.mp3").context("carol queued")?;
    assert_eq!(harness.manager.get_upload_candidate(), Some(carol));

    harness.fire_timers();
    assert_eq!(active_upload(&harness), Some(carol));
    Ok(())
}

#[test]
fn prioritized_buddies_count_as_privileged() -> Result<()> {
    let mut harness = Harness::with_config(|config| {
        config.buddies = vec![Buddy {
            username: "carol".into(),
            prioritized: true,
            trusted: false,
        }];
    })?;
    for (user, path) in [("alice", "a\\1.mp3"), ("bob", "b\\1.mp3"), ("carol", "c\\1.mp3")] {
        harness.share(path, b"data")?;
        harness.queue_upload(user, path);
        tick();
    }
    let carol = harness.upload_id("carol", "c\\1.mp3").context("carol queued")?;
    assert_eq!(harness.manager.get_upload_candidate(), Some(carol));
    Ok(())
}

#[test]
fn file_limit_counts_queued_files_only_by_default() -> Result<()> {
    let mut harness = Harness::with_config(|config| {
        config.uploads.file_limit = 1;
    })?;
    for path in ["s\\1.mp3", "s\\2.mp3", "s\\3.mp3"] {
        harness.share(path, b"data")?;
        harness.queue_upload(BOB, path);
    }

    // The first file went straight to negotiation, so it does not count.
    assert!(harness.upload_id(BOB, "s\\1.mp3").is_some());
    assert!(harness.upload_id(BOB, "s\\2.mp3").is_some());
    assert!(harness.upload_id(BOB, "s\\3.mp3").is_none());
    assert_eq!(denials(&harness, BOB), vec![RejectReason::TooManyFiles]);
    Ok(())
}

#[test]
fn file_limit_can_count_active_uploads_too() -> Result<()> {
    let mut harness = Harness::with_config(|config| {
        config.uploads.file_limit = 1;
        config.uploads.quota_accounting = QuotaAccounting::QueuedAndActive;
    })?;
    for path in ["s\\1.mp3", "s\\2.mp3"] {
        harness.share(path, b"data")?;
        harness.queue_upload(BOB, path);
    }
    assert!(harness.upload_id(BOB, "s\\2.mp3").is_none());
    assert_eq!(denials(&harness, BOB), vec![RejectReason::TooManyFiles]);
    Ok(())
}

#[test]
fn buddies_can_skip_limits() -> Result<()> {
    let mut harness = Harness::with_config(|config| {
        config.uploads.file_limit = 1;
        config.uploads.friends_no_limits = true;
        config.buddies = vec![Buddy {
            username: BOB.into(),
            prioritized: false,
            trusted: false,
        }];
    })?;
    for path in ["s\\1.mp3", "s\\2.mp3", "s\\3.mp3"] {
        harness.share(path, b"data")?;
        harness.queue_upload(BOB, path);
    }
    assert!(harness.upload_id(BOB, "s\\3.mp3").is_some());
    assert!(denials(&harness, BOB).is_empty());
    Ok(())
}

#[test]
fn size_limit_rejects_before_share_lookup() -> Result<()> {
    let mut harness = Harness::with_config(|config| {
        config.uploads.queue_limit_mib = 1;
    })?;
    let big = harness.workspace.missing_shared_file("big.iso", 2 * 1024 * 1024);
    harness.fakes.shares.add("s\\big.iso", big);
    harness.queue_upload(BOB, "s\\big.iso");
    harness.queue_upload(BOB, "s\\absent.mp3");
    let small = harness.workspace.missing_shared_file("gone.mp3", 10);
    harness.fakes.shares.add("s\\gone.mp3", small);
    harness.queue_upload(BOB, "s\\gone.mp3");

    assert_eq!(
        denials(&harness, BOB),
        vec![
            RejectReason::TooManyMegabytes,
            RejectReason::FileNotShared,
            RejectReason::FileReadError,
        ]
    );
    assert_eq!(harness.manager.transfers(TransferDirection::Upload).count(), 0);
    Ok(())
}

#[tokio::test]
async fn banned_users_are_refused_with_message() -> Result<()> {
    let mut harness = Harness::with_config(|config| {
        config.uploads.custom_ban_message = Some("see profile".into());
    })?;
    let mut events = harness.events.subscribe(None);
    harness.share(SONG, b"abcdef")?;
    harness.fakes.filter.ban("mallory", None);
    harness.queue_upload("mallory", SONG);

    assert_eq!(
        denials(&harness, "mallory"),
        vec![RejectReason::Banned(Some("see profile".into()))]
    );
    let denied = loop {
        let envelope = timeout(Duration::from_secs(1), events.next())
            .await?
            .context("event stream closed")?;
        if matches!(envelope.event, Event::UploadDenied { .. }) {
            break envelope.event;
        }
    };
    assert_eq!(
        denied,
        Event::UploadDenied {
            username: "mallory".into(),
            virtual_path: SONG.into(),
            reason: "Banned (see profile)".into(),
        }
    );
    Ok(())
}

#[test]
fn banning_drops_every_upload_of_the_user() -> Result<()> {
    let mut harness = Harness::new()?;
    for path in ["s\\1.mp3", "s\\2.mp3"] {
        harness.share(path, b"data")?;
        harness.queue_upload(BOB, path);
    }
    assert_eq!(harness.manager.transfers(TransferDirection::Upload).count(), 2);

    harness.manager.ban_user(BOB);
    assert!(harness.fakes.filter.is_banned(BOB));
    assert_eq!(harness.manager.transfers(TransferDirection::Upload).count(), 0);
    assert_eq!(
        denials(&harness, BOB),
        vec![RejectReason::Banned(None), RejectReason::Banned(None)]
    );
    assert_eq!(harness.metrics.snapshot().queued_uploads, 0);
    assert_eq!(harness.metrics.snapshot().active_uploads, 0);
    Ok(())
}

#[test]
fn legacy_request_is_accepted_when_idle_and_queued_when_busy() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.share(SONG, b"abcdef")?;
    harness.share("Share\\other.flac", b"xyz")?;
    harness.peer_reachable(BOB);
    harness.peer_reachable("dave");

    let legacy = |username: &str, token: u32, path: &str| {
        NetworkEvent::TransferRequest(IncomingTransferRequest {
            username: username.into(),
            address: None,
            direction: TransferDirection::Download,
            token: RequestToken(token),
            virtual_path: path.into(),
            size: None,
        })
    };
    harness.manager.handle_network_event(legacy(BOB, 500, SONG));
    let id = harness.upload_id(BOB, SONG).context("legacy upload")?;
    assert_eq!(harness.status(id), Some(TransferStatus::Negotiating));
    assert!(harness.fakes.network.messages_to(BOB).contains(&PeerMessage::TransferResponse {
        token: RequestToken(500),
        allowed: true,
        reason: None,
        size: Some(6),
    }));

    harness
        .manager
        .handle_network_event(legacy("dave", 501, "Share\\other.flac"));
    let queued = harness
        .upload_id("dave", "Share\\other.flac")
        .context("queued legacy upload")?;
    assert_eq!(harness.status(queued), Some(TransferStatus::Queued));
    assert!(harness.fakes.network.messages_to("dave").contains(&PeerMessage::TransferResponse {
        token: RequestToken(501),
        allowed: false,
        reason: Some(RejectReason::Queued),
        size: None,
    }));
    Ok(())
}

#[test]
fn place_in_queue_is_answered_for_queued_files() -> Result<()> {
    let mut harness = Harness::new()?;
    for (user, path) in [("alice", "a\\1.mp3"), (BOB, "b\\1.mp3"), (BOB, "b\\2.mp3")] {
        harness.share(path, b"data")?;
        harness.queue_upload(user, path);
        tick();
    }
    harness
        .manager
        .handle_network_event(NetworkEvent::PlaceInQueueRequest {
            username: BOB.into(),
            virtual_path: "b\\2.mp3".into(),
        });
    assert!(harness.fakes.network.messages_to(BOB).contains(&PeerMessage::PlaceInQueueResponse {
        virtual_path: "b\\2.mp3".into(),
        place: 2,
    }));
    Ok(())
}

#[test]
fn aborting_a_pending_upload_tells_the_peer() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.share(SONG, b"abcdef")?;
    harness.queue_upload(BOB, SONG);
    let id = harness.upload_id(BOB, SONG).context("queued")?;

    harness.manager.abort(TransferDirection::Upload, id, false)?;
    harness.manager.abort(TransferDirection::Upload, id, false)?;
    assert_eq!(harness.status(id), Some(TransferStatus::Aborted));
    assert_eq!(denials(&harness, BOB), vec![RejectReason::Cancelled]);

    harness.manager.clear(TransferDirection::Upload, id)?;
    assert!(harness.manager.transfer(id).is_none());
    Ok(())
}

#[test]
fn gauges_follow_queue_and_slots() -> Result<()> {
    let mut harness = Harness::new()?;
    for (user, path) in [("alice", "a\\1.mp3"), (BOB, "b\\1.mp3"), (BOB, "b\\2.mp3")] {
        harness.share(path, b"data")?;
        harness.queue_upload(user, path);
    }
    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.active_uploads, 1);
    assert_eq!(snapshot.queued_uploads, 2);

    harness.peer_offline("alice");
    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.active_uploads, 1);
    assert_eq!(snapshot.queued_uploads, 1);
    Ok(())
}

#[test]
fn queue_tick_refreshes_gauges() -> Result<()> {
    let mut harness = Harness::new()?;
    for path in ["b\\1.mp3", "b\\2.mp3", "b\\3.mp3"] {
        harness.share(path, b"data")?;
        harness.queue_upload(BOB, path);
    }
    harness.metrics.set_upload_gauges(0, 0);

    harness.manager.tick_upload_queue();
    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.active_uploads, 1);
    assert_eq!(snapshot.queued_uploads, 2);
    Ok(())
}
