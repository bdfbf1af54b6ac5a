//! Upload queue policy.
//!
//! # Design
//! - Pure selection over a borrowed view of the upload list; the manager
//!   applies the outcome.
//! - A user with any upload in flight is never offered a second one.
//! - Tiers are considered in order: privileged users, preferred file types,
//!   everyone else. The privileged tier is strict: while any privileged user
//!   still has queued files, normal users wait even if those privileged users
//!   are busy. The preferred tier only applies among users who are free.
//! - FIFO picks the oldest queued file. Round-robin picks the user served
//!   longest ago (never-served users rank by their oldest queued file) and
//!   then that user's oldest file. Ties fall back to insertion order.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use slsk_config::QueueMode;
use slsk_events::{TransferId, TransferStatus};

use crate::model::Transfer;

/// Inputs besides the transfers themselves.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    /// FIFO or round-robin.
    pub mode: QueueMode,
    /// Users served ahead of everyone else.
    pub privileged_users: &'a HashSet<String>,
    /// Extensions (lowercase, no dot) served ahead of other files.
    pub preferred_extensions: &'a [String],
    /// When each user last had an upload activated.
    pub last_served: &'a HashMap<String, DateTime<Utc>>,
}

impl PolicyContext<'_> {
    fn is_privileged(&self, username: &str) -> bool {
        self.privileged_users.contains(username)
    }

    fn is_preferred(&self, transfer: &Transfer) -> bool {
        let Some((_, extension)) = transfer.basename().rsplit_once('.') else {
            return false;
        };
        self.preferred_extensions
            .iter()
            .any(|preferred| preferred.eq_ignore_ascii_case(extension))
    }
}

/// Next upload to activate, or `None` when nobody may start.
#[must_use]
pub fn select_candidate<'t, I>(uploads: I, context: &PolicyContext<'_>) -> Option<&'t Transfer>
where
    I: IntoIterator<Item = &'t Transfer>,
{
    let mut busy_users = HashSet::new();
    let mut queued = Vec::new();
    for transfer in uploads {
        if transfer.status().is_active() {
            busy_users.insert(transfer.username.as_str());
        } else if *transfer.status() == TransferStatus::Queued {
            queued.push(transfer);
        }
    }

    let privileged_waiting = queued
        .iter()
        .any(|transfer| context.is_privileged(&transfer.username));

    let eligible: Vec<&Transfer> = queued
        .into_iter()
        .filter(|transfer| !privileged_waiting || context.is_privileged(&transfer.username))
        .filter(|transfer| !busy_users.contains(transfer.username.as_str()))
        .collect();

    let preferred: Vec<&Transfer> = eligible
        .iter()
        .copied()
        .filter(|transfer| context.is_preferred(transfer))
        .collect();

    let tier = if preferred.is_empty() {
        eligible
    } else {
        preferred
    };

    match context.mode {
        QueueMode::Fifo => tier.into_iter().min_by_key(|transfer| queue_order(transfer)),
        QueueMode::RoundRobin => round_robin(tier, context.last_served),
    }
}

fn round_robin<'t>(
    tier: Vec<&'t Transfer>,
    last_served: &HashMap<String, DateTime<Utc>>,
) -> Option<&'t Transfer> {
    let mut oldest_per_user: BTreeMap<&str, &'t Transfer> = BTreeMap::new();
    for transfer in tier {
        oldest_per_user
            .entry(transfer.username.as_str())
            .and_modify(|current| {
                if queue_order(transfer) < queue_order(current) {
                    *current = transfer;
                }
            })
            .or_insert(transfer);
    }

    oldest_per_user
        .into_iter()
        .min_by_key(|(username, oldest)| {
            let served = last_served
                .get(*username)
                .copied()
                .unwrap_or(oldest.queued_at);
            (served, oldest.id)
        })
        .map(|(_, oldest)| oldest)
}

fn queue_order(transfer: &Transfer) -> (DateTime<Utc>, TransferId) {
    (transfer.queued_at, transfer.id)
}

/// One-based place of `target` in the upload queue as the requester sees it.
///
/// FIFO counts the queued files ahead of it. Round-robin estimates the place
/// as the number of waiting users times the file's place in its owner's own
/// queue. A privileged requester only competes with privileged users.
#[must_use]
pub fn queue_position<'t, I>(
    uploads: I,
    target: &Transfer,
    context: &PolicyContext<'_>,
) -> Option<u32>
where
    I: IntoIterator<Item = &'t Transfer>,
{
    if *target.status() != TransferStatus::Queued {
        return None;
    }
    let privileged_only = context.is_privileged(&target.username);
    let competing: Vec<&Transfer> = uploads
        .into_iter()
        .filter(|transfer| *transfer.status() == TransferStatus::Queued)
        .filter(|transfer| !privileged_only || context.is_privileged(&transfer.username))
        .collect();

    let place = match context.mode {
        QueueMode::Fifo => competing
            .iter()
            .filter(|transfer| queue_order(transfer) <= queue_order(target))
            .count(),
        QueueMode::RoundRobin => {
            let users: HashSet<&str> = competing
                .iter()
                .map(|transfer| transfer.username.as_str())
                .collect();
            let own_place = competing
                .iter()
                .filter(|transfer| transfer.username == target.username)
                .filter(|transfer| queue_order(transfer) <= queue_order(target))
                .count();
            users.len() * own_place
        }
    };
    u32::try_from(place).ok().filter(|place| *place > 0)
}
