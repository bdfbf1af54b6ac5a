//! Reasons exchanged with peers when a transfer is refused.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use slsk_events::TransferStatus;

/// Rejection reason carried by transfer responses and upload denials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum RejectReason {
    /// The file was queued instead of started.
    Queued,
    /// The uploader gave up on the transfer.
    Cancelled,
    /// The file was already sent completely.
    Complete,
    /// The path is not shared.
    FileNotShared,
    /// The uploader could not read the file.
    FileReadError,
    /// The requester is banned, optionally with a message.
    Banned(Option<String>),
    /// The per-user file count limit was reached.
    TooManyFiles,
    /// The per-user size limit was reached.
    TooManyMegabytes,
    /// The uploader is about to quit.
    PendingShutdown,
    /// The uploader refuses this file type.
    DisallowedExtension,
    /// Anything else, kept verbatim.
    Other(String),
}

impl RejectReason {
    /// Text sent on the wire.
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Banned(Some(message)) => format!("Banned ({message})"),
            Self::Other(text) => text.clone(),
            other => other.static_text().to_string(),
        }
    }

    /// Bounded label for metrics; custom texts collapse to `other`.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Other(_) => "other",
            other => other.static_text(),
        }
    }

    const fn static_text(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Cancelled => "Cancelled",
            Self::Complete => "Complete",
            Self::FileNotShared => "File not shared.",
            Self::FileReadError => "File read error.",
            Self::Banned(_) => "Banned",
            Self::TooManyFiles => "Too many files",
            Self::TooManyMegabytes => "Too many megabytes",
            Self::PendingShutdown => "Pending shutdown.",
            Self::DisallowedExtension => "Disallowed extension",
            Self::Other(_) => "",
        }
    }

    /// Parse wire text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text {
            "Queued" => Self::Queued,
            "Cancelled" => Self::Cancelled,
            "Complete" => Self::Complete,
            "File not shared." | "File not shared" => Self::FileNotShared,
            "File read error." => Self::FileReadError,
            "Banned" => Self::Banned(None),
            "Too many files" => Self::TooManyFiles,
            "Too many megabytes" => Self::TooManyMegabytes,
            "Pending shutdown." => Self::PendingShutdown,
            "Disallowed extension" => Self::DisallowedExtension,
            other => other
                .strip_prefix("Banned (")
                .and_then(|rest| rest.strip_suffix(')'))
                .map_or_else(
                    || Self::Other(other.to_string()),
                    |message| Self::Banned(Some(message.to_string())),
                ),
        }
    }

    /// Whether a download refused for this reason stays in the remote queue.
    #[must_use]
    pub const fn keeps_download_queued(&self) -> bool {
        matches!(self, Self::Queued | Self::PendingShutdown)
    }

    /// Status a download takes when the uploader refuses it for this reason.
    #[must_use]
    pub fn download_status(&self) -> TransferStatus {
        match self {
            Self::Queued | Self::PendingShutdown => TransferStatus::Queued,
            Self::FileNotShared => TransferStatus::FileNotShared,
            Self::TooManyMegabytes => TransferStatus::QueueLimitExceeded,
            Self::FileReadError => TransferStatus::RemoteFileError,
            other => TransferStatus::Rejected(other.as_text()),
        }
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<RejectReason> for String {
    fn from(reason: RejectReason) -> Self {
        reason.as_text()
    }
}

impl From<String> for RejectReason {
    fn from(text: String) -> Self {
        Self::parse(&text)
    }
}
