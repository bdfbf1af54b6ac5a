//! Typed configuration document read by the transfer engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory holding `downloads.json` and `uploads.json`.
    pub data_dir: PathBuf,
    /// Download behaviour.
    pub downloads: DownloadSettings,
    /// Upload admission and queueing behaviour.
    pub uploads: UploadSettings,
    /// Timers shared by both directions.
    pub network: NetworkSettings,
    /// Locally trusted peers.
    pub buddies: Vec<Buddy>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
            downloads: DownloadSettings::default(),
            uploads: UploadSettings::default(),
            network: NetworkSettings::default(),
            buddies: Vec::new(),
        }
    }
}

impl TransferConfig {
    /// Look up a buddy entry by username.
    #[must_use]
    pub fn buddy(&self, username: &str) -> Option<&Buddy> {
        self.buddies.iter().find(|buddy| buddy.username == username)
    }

    /// Whether the user is on the buddy list.
    #[must_use]
    pub fn is_buddy(&self, username: &str) -> bool {
        self.buddy(username).is_some()
    }

    /// Whether the buddy list grants the user upload priority.
    #[must_use]
    pub fn is_prioritized_buddy(&self, username: &str) -> bool {
        self.buddy(username)
            .is_some_and(|buddy| buddy.prioritized || self.uploads.prefer_friends)
    }

    /// Whether the user bypasses per-user queue limits.
    #[must_use]
    pub fn is_exempt_from_limits(&self, username: &str) -> bool {
        self.uploads.friends_no_limits && self.is_buddy(username)
    }

    /// Path of the persisted download list.
    #[must_use]
    pub fn downloads_file(&self) -> PathBuf {
        self.data_dir.join("downloads.json")
    }

    /// Path of the persisted upload list.
    #[must_use]
    pub fn uploads_file(&self) -> PathBuf {
        self.data_dir.join("uploads.json")
    }
}

/// Download settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Destination for finished files.
    pub download_dir: PathBuf,
    /// Destination for partial files.
    pub incomplete_dir: PathBuf,
    /// Put each user's files under a folder named after them.
    pub username_subfolders: bool,
    /// Remove finished downloads from the list automatically.
    pub autoclear_finished: bool,
    /// Apply `filters` to newly enqueued downloads.
    pub enable_filters: bool,
    /// Patterns that mark matching downloads as filtered.
    pub filters: Vec<DownloadFilter>,
    /// Seconds between retries of failed downloads.
    pub retry_interval_secs: u64,
    /// Seconds between queue position requests.
    pub place_in_queue_interval_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from(defaults::DOWNLOAD_DIR),
            incomplete_dir: PathBuf::from(defaults::INCOMPLETE_DIR),
            username_subfolders: false,
            autoclear_finished: false,
            enable_filters: false,
            filters: Vec::new(),
            retry_interval_secs: defaults::DOWNLOAD_RETRY_INTERVAL_SECS,
            place_in_queue_interval_secs: defaults::PLACE_IN_QUEUE_INTERVAL_SECS,
        }
    }
}

impl DownloadSettings {
    /// Interval of the failed download sweep.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Interval of the queue position refresh.
    #[must_use]
    pub const fn place_in_queue_interval(&self) -> Duration {
        Duration::from_secs(self.place_in_queue_interval_secs)
    }
}

/// One download filter entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFilter {
    /// Regular expression, or wildcard text when `escaped` is set.
    pub pattern: String,
    /// Treat `pattern` as literal text where `*` matches anything.
    #[serde(default)]
    pub escaped: bool,
}

/// Order in which queued uploads are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Interleave users, serving the least recently served first.
    #[default]
    RoundRobin,
    /// Serve the oldest queued file regardless of user.
    Fifo,
}

/// Which uploads count against the per-user size and file limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuotaAccounting {
    /// Only uploads still waiting in the queue.
    #[default]
    QueuedOnly,
    /// Queued uploads plus the ones being negotiated or sent.
    QueuedAndActive,
}

/// Upload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Limit concurrency by slot count.
    pub use_upload_slots: bool,
    /// Maximum concurrent uploads when `use_upload_slots` is set.
    pub upload_slots: u32,
    /// Total upload bandwidth ceiling in KiB/s, zero for none.
    pub upload_bandwidth_kib: u64,
    /// Queue service order.
    pub queue_mode: QueueMode,
    /// Per-user queued size limit in MiB, zero for none.
    pub queue_limit_mib: u64,
    /// Per-user queued file limit, zero for none.
    pub file_limit: u32,
    /// Buddies skip per-user limits.
    pub friends_no_limits: bool,
    /// All buddies get privileged queue treatment.
    pub prefer_friends: bool,
    /// Extensions (without dot, lowercase) served ahead of other files.
    pub preferred_extensions: Vec<String>,
    /// Which uploads count against per-user limits.
    pub quota_accounting: QuotaAccounting,
    /// Remove finished uploads from the list automatically.
    pub autoclear_finished: bool,
    /// Text appended to ban rejections.
    pub custom_ban_message: Option<String>,
    /// Seconds between upload queue checks.
    pub upload_check_interval_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            use_upload_slots: true,
            upload_slots: defaults::UPLOAD_SLOTS,
            upload_bandwidth_kib: 0,
            queue_mode: QueueMode::default(),
            queue_limit_mib: defaults::QUEUE_LIMIT_MIB,
            file_limit: defaults::FILE_LIMIT,
            friends_no_limits: false,
            prefer_friends: false,
            preferred_extensions: Vec::new(),
            quota_accounting: QuotaAccounting::default(),
            autoclear_finished: false,
            custom_ban_message: None,
            upload_check_interval_secs: defaults::UPLOAD_CHECK_INTERVAL_SECS,
        }
    }
}

impl UploadSettings {
    /// Per-user queued byte limit, `None` when unlimited.
    #[must_use]
    pub const fn queue_limit_bytes(&self) -> Option<u64> {
        if self.queue_limit_mib == 0 {
            None
        } else {
            Some(self.queue_limit_mib.saturating_mul(1024 * 1024))
        }
    }

    /// Aggregate upload speed ceiling in bytes per second, `None` when unlimited.
    #[must_use]
    pub const fn bandwidth_limit_bytes(&self) -> Option<u64> {
        if self.upload_bandwidth_kib == 0 {
            None
        } else {
            Some(self.upload_bandwidth_kib.saturating_mul(1024))
        }
    }

    /// Slot ceiling, `None` when slot limiting is disabled.
    #[must_use]
    pub fn slot_limit(&self) -> Option<usize> {
        self.use_upload_slots
            .then(|| usize::try_from(self.upload_slots.max(1)).unwrap_or(usize::MAX))
    }

    /// Interval of the upload queue check.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.upload_check_interval_secs)
    }

    /// Whether the virtual path ends in one of the preferred extensions.
    #[must_use]
    pub fn is_preferred(&self, virtual_path: &str) -> bool {
        let Some((_, extension)) = virtual_path.rsplit_once('.') else {
            return false;
        };
        self.preferred_extensions
            .iter()
            .any(|preferred| preferred.eq_ignore_ascii_case(extension))
    }
}

/// Timers shared by both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Seconds to wait for a transfer response before failing with "Cannot connect".
    pub request_timeout_secs: u64,
    /// Seconds between periodic saves.
    pub save_interval_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            save_interval_secs: defaults::SAVE_INTERVAL_SECS,
        }
    }
}

impl NetworkSettings {
    /// Transfer request response timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Periodic save interval.
    #[must_use]
    pub const fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

/// Buddy list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buddy {
    /// Peer username.
    pub username: String,
    /// Served ahead of normal users.
    #[serde(default)]
    pub prioritized: bool,
    /// Allowed to push files to us without being asked.
    #[serde(default)]
    pub trusted: bool,
}
