//! Recording fakes of every collaborator the transfer manager calls.
//!
//! Each fake only records; tests drive the manager by feeding events and
//! inspect what it asked for afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use slsk_transfer_core::{
    Admission, ConnectionId, FinalizeJob, JobRunner, NetworkFilter, PeerMessage, PeerNetwork,
    RequestToken, Scheduler, ServerClient, SharedFile, SharesIndex, TimerEvent, TimerId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call made on [`RecordingNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCall {
    /// `send_message`.
    Message {
        /// Recipient.
        username: String,
        /// Payload.
        message: PeerMessage,
    },
    /// `open_file_connection`.
    OpenFileConnection {
        /// Peer.
        username: String,
        /// Token announced on the connection.
        token: RequestToken,
    },
    /// `send_file_offset`.
    FileOffset {
        /// Connection.
        connection: ConnectionId,
        /// Offset.
        offset: u64,
    },
    /// `send_file_data`.
    FileData {
        /// Connection.
        connection: ConnectionId,
        /// Bytes handed over.
        data: Vec<u8>,
    },
    /// `close_connection`.
    Close(ConnectionId),
}

/// Peer network that records calls and can be told to fail sends.
#[derive(Debug, Default)]
pub struct RecordingNetwork {
    calls: Mutex<Vec<NetworkCall>>,
    fail_messages: AtomicBool,
}

impl RecordingNetwork {
    /// Make every later `send_message` fail.
    pub fn fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    /// Every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<NetworkCall> {
        lock(&self.calls).clone()
    }

    /// Drain recorded calls.
    pub fn take_calls(&self) -> Vec<NetworkCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    /// Messages sent to `username`, oldest first.
    #[must_use]
    pub fn messages_to(&self, username: &str) -> Vec<PeerMessage> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                NetworkCall::Message {
                    username: recipient,
                    message,
                } if recipient == username => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Tokens of the transfer requests sent to `username`.
    #[must_use]
    pub fn request_tokens(&self, username: &str) -> Vec<RequestToken> {
        self.messages_to(username)
            .into_iter()
            .filter_map(|message| match message {
                PeerMessage::TransferRequest { token, .. } => Some(token),
                _ => None,
            })
            .collect()
    }

    /// Connections closed so far.
    #[must_use]
    pub fn closed(&self) -> Vec<ConnectionId> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                NetworkCall::Close(connection) => Some(*connection),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: NetworkCall) {
        lock(&self.calls).push(call);
    }
}

impl PeerNetwork for RecordingNetwork {
    fn send_message(&self, username: &str, message: PeerMessage) -> anyhow::Result<()> {
        if self.fail_messages.load(Ordering::SeqCst) {
            bail!("peer unreachable");
        }
        self.record(NetworkCall::Message {
            username: username.to_string(),
            message,
        });
        Ok(())
    }

    fn open_file_connection(&self, username: &str, token: RequestToken) -> anyhow::Result<()> {
        self.record(NetworkCall::OpenFileConnection {
            username: username.to_string(),
            token,
        });
        Ok(())
    }

    fn send_file_offset(&self, connection: ConnectionId, offset: u64) -> anyhow::Result<()> {
        self.record(NetworkCall::FileOffset { connection, offset });
        Ok(())
    }

    fn send_file_data(&self, connection: ConnectionId, data: Vec<u8>) -> anyhow::Result<()> {
        self.record(NetworkCall::FileData { connection, data });
        Ok(())
    }

    fn close_connection(&self, connection: ConnectionId) {
        self.record(NetworkCall::Close(connection));
    }
}

/// Server client that records watch, address and speed requests.
#[derive(Debug, Default)]
pub struct RecordingServer {
    watched: Mutex<Vec<String>>,
    address_requests: Mutex<Vec<String>>,
    upload_speeds: Mutex<Vec<u64>>,
}

impl RecordingServer {
    /// Users passed to `watch_user`.
    #[must_use]
    pub fn watched(&self) -> Vec<String> {
        lock(&self.watched).clone()
    }

    /// Users passed to `request_user_address`.
    #[must_use]
    pub fn address_requests(&self) -> Vec<String> {
        lock(&self.address_requests).clone()
    }

    /// Speeds reported for finished uploads.
    #[must_use]
    pub fn upload_speeds(&self) -> Vec<u64> {
        lock(&self.upload_speeds).clone()
    }
}

impl ServerClient for RecordingServer {
    fn watch_user(&self, username: &str) {
        lock(&self.watched).push(username.to_string());
    }

    fn request_user_address(&self, username: &str) {
        lock(&self.address_requests).push(username.to_string());
    }

    fn send_upload_speed(&self, speed: u64) {
        lock(&self.upload_speeds).push(speed);
    }
}

/// Shares keyed by virtual path, visible to everyone.
#[derive(Debug, Default)]
pub struct FakeShares {
    files: Mutex<HashMap<String, SharedFile>>,
}

impl FakeShares {
    /// Share `file` as `virtual_path`.
    pub fn add(&self, virtual_path: impl Into<String>, file: SharedFile) {
        lock(&self.files).insert(virtual_path.into(), file);
    }
}

impl SharesIndex for FakeShares {
    fn shared_file(&self, _username: &str, virtual_path: &str) -> Option<SharedFile> {
        lock(&self.files).get(virtual_path).cloned()
    }
}

/// Ban list and address block list.
#[derive(Debug, Default)]
pub struct FakeFilter {
    banned: Mutex<HashMap<String, Option<String>>>,
    blocked: Mutex<HashSet<String>>,
}

impl FakeFilter {
    /// Ban `username`, optionally with a message.
    pub fn ban(&self, username: impl Into<String>, message: Option<String>) {
        lock(&self.banned).insert(username.into(), message);
    }

    /// Block `username` as if their address were filtered.
    pub fn block(&self, username: impl Into<String>) {
        lock(&self.blocked).insert(username.into());
    }

    /// Whether `username` is on the ban list.
    #[must_use]
    pub fn is_banned(&self, username: &str) -> bool {
        lock(&self.banned).contains_key(username)
    }
}

impl NetworkFilter for FakeFilter {
    fn check(&self, username: &str, _address: Option<IpAddr>) -> Admission {
        if let Some(message) = lock(&self.banned).get(username) {
            return Admission::Banned(message.clone());
        }
        if lock(&self.blocked).contains(username) {
            return Admission::Blocked;
        }
        Admission::Allowed
    }

    fn ban_user(&self, username: &str) {
        self.ban(username, None);
    }
}

/// Timers that only fire when the test says so.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<TimerId, (Duration, TimerEvent)>>,
    cancelled: Mutex<Vec<TimerId>>,
}

impl ManualScheduler {
    /// Timers armed and not cancelled, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<TimerEvent> {
        lock(&self.pending).values().map(|(_, event)| *event).collect()
    }

    /// Delays of the pending timers.
    #[must_use]
    pub fn pending_delays(&self) -> Vec<Duration> {
        lock(&self.pending).values().map(|(delay, _)| *delay).collect()
    }

    /// Timers cancelled so far.
    #[must_use]
    pub fn cancelled(&self) -> Vec<TimerId> {
        lock(&self.cancelled).clone()
    }

    /// Remove and return every pending timer, as if they all expired.
    pub fn fire_all(&self) -> Vec<TimerEvent> {
        std::mem::take(&mut *lock(&self.pending))
            .into_values()
            .map(|(_, event)| event)
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerId {
        let timer = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.pending).insert(timer, (delay, event));
        timer
    }

    fn cancel(&self, timer: TimerId) {
        if lock(&self.pending).remove(&timer).is_some() {
            lock(&self.cancelled).push(timer);
        }
    }
}

/// Job runner that keeps jobs until the test runs them.
#[derive(Debug, Default)]
pub struct RecordingJobRunner {
    jobs: Mutex<Vec<FinalizeJob>>,
}

impl RecordingJobRunner {
    /// Drain submitted jobs.
    pub fn take_jobs(&self) -> Vec<FinalizeJob> {
        std::mem::take(&mut *lock(&self.jobs))
    }
}

impl JobRunner for RecordingJobRunner {
    fn submit(&self, job: FinalizeJob) {
        lock(&self.jobs).push(job);
    }
}

/// One of each fake, shared with the code under test.
#[derive(Debug, Clone, Default)]
pub struct Fakes {
    /// Peer network.
    pub network: Arc<RecordingNetwork>,
    /// Server client.
    pub server: Arc<RecordingServer>,
    /// Shares.
    pub shares: Arc<FakeShares>,
    /// Ban list.
    pub filter: Arc<FakeFilter>,
    /// Timers.
    pub scheduler: Arc<ManualScheduler>,
    /// Finalize jobs.
    pub jobs: Arc<RecordingJobRunner>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use slsk_events::TransferId;

    #[test]
    fn cancelled_timers_leave_pending() {
        let scheduler = ManualScheduler::default();
        let event = TimerEvent::RequestTimeout {
            transfer_id: TransferId(7),
            token: None,
        };
        let first = scheduler.schedule(Duration::from_secs(1), event);
        scheduler.schedule(Duration::from_secs(2), event);
        scheduler.cancel(first);
        scheduler.cancel(first);

        assert_eq!(scheduler.pending().len(), 1);
        assert_eq!(scheduler.cancelled(), vec![first]);
        assert_eq!(scheduler.fire_all().len(), 1);
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn failing_network_records_nothing() {
        let network = RecordingNetwork::default();
        network.fail_messages(true);
        let sent = network.send_message(
            "peer",
            PeerMessage::QueueUpload {
                virtual_path: "a\\b.mp3".into(),
            },
        );
        assert!(sent.is_err());
        assert!(network.calls().is_empty());
    }

    #[test]
    fn filter_reports_bans_before_blocks() {
        let filter = FakeFilter::default();
        filter.block("mallory");
        filter.ban("mallory", Some("go away".into()));
        assert_eq!(
            filter.check("mallory", None),
            Admission::Banned(Some("go away".into()))
        );
        assert_eq!(filter.check("alice", None), Admission::Allowed);
    }
}
