#![forbid(unsafe_code)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Event bus connecting the transfer engine to its observers.
//!
//! The GUI, plugin glue and metrics exporters never touch transfer records;
//! they subscribe here and receive read-only snapshots. Internally the bus uses
//! `tokio::broadcast` with a bounded buffer plus a replay ring so a late
//! subscriber can catch up from a known event id. When the channel overflows,
//! the oldest events are dropped.

mod transfer;

pub use transfer::{TransferDirection, TransferId, TransferSnapshot, TransferStatus};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Identifier assigned to each event emitted by the engine.
pub type EventId = u64;

const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed events surfaced by the transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A transfer entered the manager.
    TransferAdded {
        /// Snapshot at creation time.
        snapshot: TransferSnapshot,
    },
    /// A transfer changed state or made progress.
    TransferUpdated {
        /// Snapshot after the change.
        snapshot: TransferSnapshot,
    },
    /// A transfer was cleared from the manager.
    TransferRemoved {
        /// Identifier of the removed transfer.
        transfer_id: TransferId,
        /// Direction of the removed transfer.
        direction: TransferDirection,
    },
    /// An upload request from a peer was refused.
    UploadDenied {
        /// Requesting peer.
        username: String,
        /// Requested path.
        virtual_path: String,
        /// Reason sent back to the peer.
        reason: String,
    },
    /// Set of degraded engine components changed.
    HealthChanged {
        /// Components currently degraded.
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TransferAdded { .. } => "transfer_added",
            Self::TransferUpdated { .. } => "transfer_updated",
            Self::TransferRemoved { .. } => "transfer_removed",
            Self::UploadDenied { .. } => "upload_denied",
            Self::HealthChanged { .. } => "health_changed",
        }
    }
}

/// Metadata wrapper around events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a bus whose broadcast channel and replay ring share `capacity`.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish an event, assigning it the next sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.lock_buffer();
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe, replaying buffered events newer than `since_id` first.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let backlog = since_id.map_or_else(VecDeque::new, |since| {
            self.lock_buffer()
                .iter()
                .filter(|item| item.id > since)
                .cloned()
                .collect()
        });

        EventStream {
            backlog,
            receiver: self.sender.subscribe(),
        }
    }

    /// Last assigned identifier, if anything was published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_buffer().back().map(|event| event.id)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Yields events from the replay backlog, then from the live channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event; lagged receivers skip what they missed.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` for consumers built on stream combinators.
    pub fn into_stream(self) -> impl Stream<Item = EventEnvelope> + Send + 'static {
        tokio_stream::iter(self.backlog)
            .chain(BroadcastStream::new(self.receiver).filter_map(Result::ok))
    }
}
