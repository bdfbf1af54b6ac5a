//! Default values for the transfer configuration document.
//!
//! # Design
//! - Keep every numeric default in one place so tests and docs agree.
//! - Intervals are stored in seconds to keep the JSON document readable.

/// Concurrent upload slots when slot limiting is enabled.
pub const UPLOAD_SLOTS: u32 = 2;
/// Per-user queued size limit in MiB.
pub const QUEUE_LIMIT_MIB: u64 = 150;
/// Per-user queued file count limit.
pub const FILE_LIMIT: u32 = 1_000;
/// Seconds to wait for a peer to answer a transfer request.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Seconds between upload queue checks.
pub const UPLOAD_CHECK_INTERVAL_SECS: u64 = 10;
/// Seconds between retries of failed downloads.
pub const DOWNLOAD_RETRY_INTERVAL_SECS: u64 = 180;
/// Seconds between queue position requests for queued downloads.
pub const PLACE_IN_QUEUE_INTERVAL_SECS: u64 = 180;
/// Seconds between periodic saves of the transfer lists.
pub const SAVE_INTERVAL_SECS: u64 = 180;
/// Directory for finished downloads.
pub const DOWNLOAD_DIR: &str = "downloads";
/// Directory for partial downloads.
pub const INCOMPLETE_DIR: &str = "downloads/incomplete";
/// Directory holding the persisted transfer lists.
pub const DATA_DIR: &str = "data";
