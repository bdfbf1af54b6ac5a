//! Ordered transfer table with keyed lookup and per-user counters.
//!
//! # Design
//! - Iteration follows transfer ids, i.e. insertion order.
//! - `(username, virtual_path)` maps to at most one transfer.
//! - Per-user counters are adjusted on every insert, update and removal by
//!   dequeuing the old contribution and enqueuing the new one; they are never
//!   rebuilt by scanning outside tests.

use std::collections::{BTreeMap, HashMap};

use slsk_events::TransferId;
use slsk_transfer_core::{ConnectionId, RequestToken, Transfer};

/// Files and bytes a user has in one bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Number of files.
    pub files: u32,
    /// Sum of their sizes.
    pub bytes: u64,
}

impl Tally {
    fn add(&mut self, size: u64) {
        self.files = self.files.saturating_add(1);
        self.bytes = self.bytes.saturating_add(size);
    }

    fn sub(&mut self, size: u64) {
        self.files = self.files.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(size);
    }

    const fn is_empty(self) -> bool {
        self.files == 0 && self.bytes == 0
    }
}

/// Queued and in-flight tallies of one user.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UserCounters {
    /// Transfers waiting in the queue.
    pub queued: Tally,
    /// Transfers negotiating or moving bytes.
    pub active: Tally,
}

#[derive(Clone, Copy)]
enum Bucket {
    Queued,
    Active,
}

fn bucket_of(transfer: &Transfer) -> Option<Bucket> {
    let status = transfer.status();
    if status.is_active() {
        Some(Bucket::Active)
    } else if *status == slsk_events::TransferStatus::Queued {
        Some(Bucket::Queued)
    } else {
        None
    }
}

/// All transfers of one direction.
#[derive(Debug, Default)]
pub struct TransferTable {
    transfers: BTreeMap<TransferId, Transfer>,
    keys: HashMap<(String, String), TransferId>,
    counters: HashMap<String, UserCounters>,
}

impl TransferTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Add a transfer. An existing record for the same file is replaced and
    /// returned.
    pub fn insert(&mut self, transfer: Transfer) -> Option<Transfer> {
        let key = (transfer.username.clone(), transfer.virtual_path.clone());
        let replaced = self
            .keys
            .get(&key)
            .copied()
            .and_then(|id| self.remove(id));
        self.enqueue(&transfer);
        self.keys.insert(key, transfer.id);
        self.transfers.insert(transfer.id, transfer);
        replaced
    }

    /// Remove a transfer.
    pub fn remove(&mut self, id: TransferId) -> Option<Transfer> {
        let transfer = self.transfers.remove(&id)?;
        self.dequeue(&transfer);
        self.keys
            .remove(&(transfer.username.clone(), transfer.virtual_path.clone()));
        Some(transfer)
    }

    /// Look up by id.
    #[must_use]
    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.get(&id)
    }

    /// Whether `id` is present.
    #[must_use]
    pub fn contains(&self, id: TransferId) -> bool {
        self.transfers.contains_key(&id)
    }

    /// Look up by file.
    #[must_use]
    pub fn find(&self, username: &str, virtual_path: &str) -> Option<&Transfer> {
        self.keys
            .get(&(username.to_string(), virtual_path.to_string()))
            .and_then(|id| self.transfers.get(id))
    }

    /// Transfer waiting on `token` from `username`.
    #[must_use]
    pub fn find_by_token(&self, username: &str, token: RequestToken) -> Option<&Transfer> {
        self.transfers
            .values()
            .find(|transfer| transfer.request_token == Some(token) && transfer.username == username)
    }

    /// Transfer using `connection`.
    #[must_use]
    pub fn find_by_connection(&self, connection: ConnectionId) -> Option<&Transfer> {
        self.transfers
            .values()
            .find(|transfer| transfer.connection == Some(connection))
    }

    /// Whether any transfer holds `token`.
    #[must_use]
    pub fn token_in_use(&self, token: RequestToken) -> bool {
        self.transfers
            .values()
            .any(|transfer| transfer.request_token == Some(token))
    }

    /// Mutate a transfer, keeping counters in step.
    ///
    /// The closure must not change the username or the virtual path.
    pub fn update<R>(&mut self, id: TransferId, apply: impl FnOnce(&mut Transfer) -> R) -> Option<R> {
        let transfer = self.transfers.get_mut(&id)?;
        let before = (bucket_of(transfer), transfer.size);
        let result = apply(transfer);
        let after = (bucket_of(transfer), transfer.size);
        if before.0.is_some() || after.0.is_some() {
            let username = transfer.username.clone();
            self.adjust(&username, before, after);
        }
        Some(result)
    }

    /// Transfers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.transfers.values()
    }

    /// Ids of `username`'s transfers, in insertion order.
    #[must_use]
    pub fn ids_for_user(&self, username: &str) -> Vec<TransferId> {
        self.transfers
            .values()
            .filter(|transfer| transfer.username == username)
            .map(|transfer| transfer.id)
            .collect()
    }

    /// Tallies of `username`.
    #[must_use]
    pub fn counters(&self, username: &str) -> UserCounters {
        self.counters.get(username).copied().unwrap_or_default()
    }

    /// Users with at least one queued transfer.
    #[cfg(test)]
    fn queued_users(&self) -> impl Iterator<Item = &str> {
        self.counters
            .iter()
            .filter(|(_, counters)| counters.queued.files > 0)
            .map(|(username, _)| username.as_str())
    }

    /// Transfers negotiating or moving bytes, across users.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.counters
            .values()
            .map(|counters| counters.active.files as usize)
            .sum()
    }

    /// Queued transfers, across users.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.counters
            .values()
            .map(|counters| counters.queued.files as usize)
            .sum()
    }

    fn enqueue(&mut self, transfer: &Transfer) {
        if let Some(bucket) = bucket_of(transfer) {
            let counters = self.counters.entry(transfer.username.clone()).or_default();
            tally_mut(counters, bucket).add(transfer.size);
        }
    }

    fn dequeue(&mut self, transfer: &Transfer) {
        if let Some(bucket) = bucket_of(transfer) {
            self.adjust(&transfer.username, (Some(bucket), transfer.size), (None, 0));
        }
    }

    fn adjust(
        &mut self,
        username: &str,
        before: (Option<Bucket>, u64),
        after: (Option<Bucket>, u64),
    ) {
        let counters = self.counters.entry(username.to_string()).or_default();
        if let (Some(bucket), size) = before {
            tally_mut(counters, bucket).sub(size);
        }
        if let (Some(bucket), size) = after {
            tally_mut(counters, bucket).add(size);
        }
        if counters.queued.is_empty() && counters.active.is_empty() {
            self.counters.remove(username);
        }
    }

    /// Recompute every counter by scanning and compare with the maintained
    /// ones.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut scanned: HashMap<String, UserCounters> = HashMap::new();
        for transfer in self.transfers.values() {
            if let Some(bucket) = bucket_of(transfer) {
                let counters = scanned.entry(transfer.username.clone()).or_default();
                tally_mut(counters, bucket).add(transfer.size);
            }
        }
        assert_eq!(scanned, self.counters, "per-user counters drifted");
        assert_eq!(self.keys.len(), self.transfers.len(), "key index drifted");
    }
}

const fn tally_mut(counters: &mut UserCounters, bucket: Bucket) -> &mut Tally {
    match bucket {
        Bucket::Queued => &mut counters.queued,
        Bucket::Active => &mut counters.active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use slsk_events::{TransferDirection, TransferStatus};
    use slsk_transfer_core::NegotiationEvent;

    fn upload(id: u64, username: &str, path: &str, size: u64) -> Transfer {
        Transfer::new(
            TransferId(id),
            TransferDirection::Upload,
            username,
            path,
            "/share",
            Utc::now(),
        )
        .with_size(size)
    }

    #[test]
    fn counters_follow_status_changes() {
        let mut table = TransferTable::new();
        table.insert(upload(1, "alice", "a\\1.mp3", 100));
        table.insert(upload(2, "alice", "a\\2.mp3", 50));
        table.insert(upload(3, "bob", "b\\1.mp3", 10));
        table.assert_consistent();
        assert_eq!(
            table.counters("alice").queued,
            Tally {
                files: 2,
                bytes: 150
            }
        );

        table
            .update(TransferId(1), |transfer| transfer.apply(&NegotiationEvent::Activate).is_ok())
            .unwrap();
        table.assert_consistent();
        assert_eq!(table.counters("alice").queued.files, 1);
        assert_eq!(table.counters("alice").active.bytes, 100);
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.queued_count(), 2);

        table.update(TransferId(1), |transfer| {
            transfer.apply(&NegotiationEvent::Abort).is_ok()
        });
        table.remove(TransferId(3));
        table.assert_consistent();
        assert_eq!(table.counters("bob"), UserCounters::default());
        assert_eq!(table.queued_users().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[test]
    fn size_changes_move_bytes() {
        let mut table = TransferTable::new();
        table.insert(upload(1, "alice", "a\\1.mp3", 0));
        table.update(TransferId(1), |transfer| transfer.size = 4_096);
        table.assert_consistent();
        assert_eq!(table.counters("alice").queued.bytes, 4_096);
    }

    #[test]
    fn same_file_replaces_previous_record() {
        let mut table = TransferTable::new();
        table.insert(upload(1, "alice", "a\\1.mp3", 5).with_status(TransferStatus::Finished));
        let replaced = table.insert(upload(2, "alice", "a\\1.mp3", 5));
        assert_eq!(replaced.map(|transfer| transfer.id), Some(TransferId(1)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find("alice", "a\\1.mp3").map(|t| t.id), Some(TransferId(2)));
        table.assert_consistent();
    }

    #[test]
    fn lookups_by_token_and_connection() {
        let mut table = TransferTable::new();
        table.insert(upload(1, "alice", "a\\1.mp3", 5));
        table.update(TransferId(1), |transfer| {
            transfer.request_token = Some(RequestToken(44));
            transfer.connection = Some(ConnectionId(9));
        });

        assert!(table.token_in_use(RequestToken(44)));
        assert!(table.find_by_token("alice", RequestToken(44)).is_some());
        assert!(table.find_by_token("bob", RequestToken(44)).is_none());
        assert_eq!(
            table.find_by_connection(ConnectionId(9)).map(|t| t.id),
            Some(TransferId(1))
        );
        assert_eq!(table.ids_for_user("alice"), vec![TransferId(1)]);
    }
}
