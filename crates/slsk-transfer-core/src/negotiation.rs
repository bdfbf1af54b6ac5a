//! Peer negotiation state machine.
//!
//! # Design
//! - Transitions are a pure function of the current status and an event, so
//!   ordering rules can be tested without a network.
//! - `Finished` accepts nothing. `Aborted` only accepts a re-queue.
//! - Events that do not apply to the current status are reported as `None`
//!   and left for the caller to log; they never corrupt state.
//!
//! Happy path:
//! `Queued → GettingStatus → GettingAddress → Connecting → Requesting →
//! Negotiating | WaitingForConnection → Negotiating → Transferring → Finished`.

use slsk_events::TransferStatus;

/// Inputs driving a transfer through the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// The manager starts working on the transfer and asks for the peer's status.
    Activate,
    /// The server reported the peer online.
    PeerOnline {
        /// The peer's address is already cached.
        address_known: bool,
    },
    /// The server resolved the peer's address.
    AddressResolved,
    /// The server reported the peer offline.
    PeerOffline,
    /// A transfer request left with a fresh token and a response timer.
    RequestSent,
    /// The peer accepted our request.
    Accepted {
        /// We open the file connection (we are the uploader).
        we_connect: bool,
    },
    /// We accepted a request the peer sent us.
    IncomingAccepted {
        /// We open the file connection (we are the uploader).
        we_connect: bool,
    },
    /// The peer refused the transfer; the status is derived from its reason.
    Rejected(TransferStatus),
    /// No response, or no file connection, before the timer fired.
    TimedOut,
    /// Neither a direct nor an indirect connection could be made.
    ConnectFailed,
    /// The file connection is up.
    FileConnected,
    /// Payload bytes moved.
    DataFlowing,
    /// Every byte has been moved.
    Completed,
    /// The connection dropped.
    ConnectionLost {
        /// The server says the peer went offline.
        peer_offline: bool,
    },
    /// Local filesystem failure, or a local admission failure.
    LocalFailure(TransferStatus),
    /// A download matched a download filter.
    Filtered,
    /// The user paused the transfer.
    Pause,
    /// The user or a ban stopped the transfer.
    Abort,
    /// Put the transfer back into the queue.
    Requeue,
}

impl NegotiationEvent {
    /// Short label for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::PeerOnline { .. } => "peer_online",
            Self::AddressResolved => "address_resolved",
            Self::PeerOffline => "peer_offline",
            Self::RequestSent => "request_sent",
            Self::Accepted { .. } => "accepted",
            Self::IncomingAccepted { .. } => "incoming_accepted",
            Self::Rejected(_) => "rejected",
            Self::TimedOut => "timed_out",
            Self::ConnectFailed => "connect_failed",
            Self::FileConnected => "file_connected",
            Self::DataFlowing => "data_flowing",
            Self::Completed => "completed",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::LocalFailure(_) => "local_failure",
            Self::Filtered => "filtered",
            Self::Pause => "pause",
            Self::Abort => "abort",
            Self::Requeue => "requeue",
        }
    }
}

/// Status after `event`, or `None` when the event does not apply to `current`.
#[must_use]
pub fn next_status(current: &TransferStatus, event: &NegotiationEvent) -> Option<TransferStatus> {
    use NegotiationEvent as E;
    use TransferStatus as S;

    match current {
        S::Finished => return None,
        S::Aborted => {
            return match event {
                E::Requeue => Some(S::Queued),
                E::Abort => Some(S::Aborted),
                _ => None,
            };
        }
        _ => {}
    }

    let waiting = matches!(current, S::Queued | S::UserLoggedOff) || current.is_retryable();

    match event {
        E::Activate if waiting || *current == S::GettingStatus => Some(S::GettingStatus),
        E::PeerOnline { address_known } if *current == S::GettingStatus => Some(if *address_known {
            S::Connecting
        } else {
            S::GettingAddress
        }),
        E::AddressResolved if matches!(current, S::GettingStatus | S::GettingAddress) => {
            Some(S::Connecting)
        }
        E::PeerOffline if current.is_active() || waiting => Some(S::UserLoggedOff),
        E::RequestSent
            if matches!(current, S::GettingStatus | S::GettingAddress | S::Connecting) =>
        {
            Some(S::Requesting)
        }
        E::Accepted { we_connect } if *current == S::Requesting => Some(handshake(*we_connect)),
        E::IncomingAccepted { we_connect } if *current != S::Transferring => {
            Some(handshake(*we_connect))
        }
        E::Rejected(status) if current.is_active() || waiting => Some(status.clone()),
        E::TimedOut | E::ConnectFailed if current.is_negotiating() => Some(S::CannotConnect),
        E::FileConnected if matches!(current, S::WaitingForConnection | S::Negotiating) => {
            Some(S::Negotiating)
        }
        E::DataFlowing if matches!(current, S::Negotiating | S::Transferring) => {
            Some(S::Transferring)
        }
        E::Completed if matches!(current, S::Negotiating | S::Transferring) => Some(S::Finished),
        E::ConnectionLost { peer_offline } if current.is_active() => Some(if *peer_offline {
            S::UserLoggedOff
        } else {
            S::ConnectionClosed
        }),
        E::LocalFailure(status) => Some(status.clone()),
        E::Filtered if *current == S::Queued => Some(S::Filtered),
        E::Pause => Some(S::Paused),
        E::Abort => Some(S::Aborted),
        E::Requeue => Some(S::Queued),
        _ => None,
    }
}

const fn handshake(we_connect: bool) -> TransferStatus {
    if we_connect {
        TransferStatus::Negotiating
    } else {
        TransferStatus::WaitingForConnection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransferStatus as S;

    fn drive(start: S, events: &[NegotiationEvent]) -> Option<S> {
        events
            .iter()
            .try_fold(start, |status, event| next_status(&status, event))
    }

    #[test]
    fn upload_happy_path() {
        let end = drive(
            S::Queued,
            &[
                NegotiationEvent::Activate,
                NegotiationEvent::PeerOnline {
                    address_known: false,
                },
                NegotiationEvent::AddressResolved,
                NegotiationEvent::RequestSent,
                NegotiationEvent::Accepted { we_connect: true },
                NegotiationEvent::FileConnected,
                NegotiationEvent::DataFlowing,
                NegotiationEvent::DataFlowing,
                NegotiationEvent::Completed,
            ],
        );
        assert_eq!(end, Some(S::Finished));
    }

    #[test]
    fn download_waits_for_peer_connection() {
        let status = drive(
            S::GettingStatus,
            &[
                NegotiationEvent::PeerOnline {
                    address_known: true,
                },
                NegotiationEvent::RequestSent,
                NegotiationEvent::Accepted { we_connect: false },
            ],
        );
        assert_eq!(status, Some(S::WaitingForConnection));
        assert_eq!(
            next_status(&S::WaitingForConnection, &NegotiationEvent::TimedOut),
            Some(S::CannotConnect)
        );
    }

    #[test]
    fn out_of_order_events_are_ignored() {
        assert_eq!(
            next_status(&S::Queued, &NegotiationEvent::Accepted { we_connect: true }),
            None
        );
        assert_eq!(
            next_status(&S::Requesting, &NegotiationEvent::DataFlowing),
            None
        );
        assert_eq!(next_status(&S::Transferring, &NegotiationEvent::TimedOut), None);
        assert_eq!(
            next_status(&S::Queued, &NegotiationEvent::ConnectionLost { peer_offline: false }),
            None
        );
    }

    #[test]
    fn finished_is_immutable() {
        let events = [
            NegotiationEvent::Abort,
            NegotiationEvent::Requeue,
            NegotiationEvent::ConnectionLost { peer_offline: true },
            NegotiationEvent::LocalFailure(S::LocalFileError),
            NegotiationEvent::Pause,
        ];
        for event in &events {
            assert_eq!(next_status(&S::Finished, event), None, "{}", event.name());
        }
    }

    #[test]
    fn aborted_only_accepts_requeue() {
        assert_eq!(
            next_status(&S::Aborted, &NegotiationEvent::ConnectionLost { peer_offline: false }),
            None
        );
        assert_eq!(next_status(&S::Aborted, &NegotiationEvent::Activate), None);
        assert_eq!(
            next_status(&S::Aborted, &NegotiationEvent::Requeue),
            Some(S::Queued)
        );
    }

    #[test]
    fn connection_loss_distinguishes_offline_peer() {
        assert_eq!(
            next_status(&S::Transferring, &NegotiationEvent::ConnectionLost { peer_offline: true }),
            Some(S::UserLoggedOff)
        );
        assert_eq!(
            next_status(&S::Negotiating, &NegotiationEvent::ConnectionLost { peer_offline: false }),
            Some(S::ConnectionClosed)
        );
    }

    #[test]
    fn rejection_reason_becomes_status() {
        assert_eq!(
            next_status(
                &S::Requesting,
                &NegotiationEvent::Rejected(S::Rejected("Banned".into()))
            ),
            Some(S::Rejected("Banned".into()))
        );
        assert_eq!(
            next_status(&S::Requesting, &NegotiationEvent::Rejected(S::Queued)),
            Some(S::Queued)
        );
    }

    #[test]
    fn failed_downloads_can_be_reactivated() {
        for status in [S::CannotConnect, S::ConnectionClosed, S::UserLoggedOff, S::Queued] {
            assert_eq!(
                next_status(&status, &NegotiationEvent::Activate),
                Some(S::GettingStatus)
            );
        }
        assert_eq!(next_status(&S::LocalFileError, &NegotiationEvent::Activate), None);
    }
}
