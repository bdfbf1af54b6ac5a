//! Transfer list persistence.
//!
//! # Design
//! - A file is a JSON array of rows:
//!   `[username, virtual_path, folder_path, status, size, offset, attributes]`.
//! - Attributes are an object keyed by attribute code. Older files store them
//!   as a stringified mapping, or as a bitrate string (`"320"`,
//!   `"238 (vbr)"`) followed by an eighth length column (`"4:50"`); both are
//!   converted on load.
//! - Rows are kept as found. Restart normalization belongs to the manager,
//!   so saving what was loaded writes the same rows back.
//! - Saving writes a sibling temp file and renames it into place.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use slsk_events::TransferStatus;
use slsk_transfer_core::{FileAttribute, FileAttributes, Transfer};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// One persisted transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTransfer {
    /// Remote peer.
    pub username: String,
    /// Network path.
    pub virtual_path: String,
    /// Local folder.
    pub folder_path: String,
    /// Status at save time.
    pub status: TransferStatus,
    /// Size in bytes.
    pub size: u64,
    /// Bytes moved, `None` when never started.
    pub current_byte_offset: Option<u64>,
    /// Peer-supplied metadata.
    pub file_attributes: FileAttributes,
}

impl StoredTransfer {
    /// Row for a live transfer.
    #[must_use]
    pub fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            username: transfer.username.clone(),
            virtual_path: transfer.virtual_path.clone(),
            folder_path: transfer.folder_path.display().to_string(),
            status: transfer.status().clone(),
            size: transfer.size,
            current_byte_offset: transfer.current_byte_offset,
            file_attributes: transfer.file_attributes.clone(),
        }
    }

    fn to_row(&self) -> Value {
        json!([
            self.username,
            self.virtual_path,
            self.folder_path,
            self.status.as_str(),
            self.size,
            self.current_byte_offset,
            self.file_attributes,
        ])
    }

    fn from_row(row: &Value) -> Option<Self> {
        let columns = row.as_array()?;
        let username = columns.first()?.as_str()?.to_string();
        let virtual_path = columns.get(1)?.as_str()?.to_string();
        let folder_path = columns
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let status = columns
            .get(3)
            .and_then(Value::as_str)
            .map_or(TransferStatus::Queued, TransferStatus::parse);
        let size = columns.get(4).and_then(as_integer).unwrap_or(0);
        let current_byte_offset = columns.get(5).and_then(as_integer);
        let file_attributes = parse_attributes(columns.get(6), columns.get(7));

        Some(Self {
            username,
            virtual_path,
            folder_path,
            status,
            size,
            current_byte_offset,
            file_attributes,
        })
    }
}

/// Reads and writes one transfer list file.
#[derive(Debug, Clone)]
pub struct TransferStore {
    path: PathBuf,
}

impl TransferStore {
    /// Store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every row; a missing file is an empty list.
    ///
    /// Rows that do not carry at least a username and a path are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or is not a JSON array.
    pub fn load(&self) -> StoreResult<Vec<StoredTransfer>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "transfer list missing; starting empty");
                return Ok(Vec::new());
            }
            Err(err) => return Err(StoreError::io("store.read", &self.path, err)),
        };

        let document: Value = serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::json("store.parse", &self.path, source))?;
        let Value::Array(rows) = document else {
            return Err(StoreError::invalid(&self.path, None, "document is not a list"));
        };

        let mut transfers = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            match StoredTransfer::from_row(row) {
                Some(transfer) => transfers.push(transfer),
                None => warn!(
                    path = %self.path.display(),
                    index,
                    "skipping malformed transfer row"
                ),
            }
        }
        Ok(transfers)
    }

    /// Replace the file with `transfers`.
    ///
    /// # Errors
    ///
    /// Returns an error when the folder or file cannot be written.
    pub fn save(&self, transfers: &[StoredTransfer]) -> StoreResult<()> {
        if let Some(parent) = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            fs::create_dir_all(parent)
                .map_err(|source| StoreError::io("store.create_parent", parent, source))?;
        }

        let rows: Vec<Value> = transfers.iter().map(StoredTransfer::to_row).collect();
        let payload = serde_json::to_vec(&rows)
            .map_err(|source| StoreError::json("store.serialize", &self.path, source))?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, payload)
            .map_err(|source| StoreError::io("store.write", &staging, source))?;
        fs::rename(&staging, &self.path)
            .map_err(|source| StoreError::io("store.rename", &self.path, source))
    }
}

fn as_integer(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn parse_attributes(value: Option<&Value>, legacy_length: Option<&Value>) -> FileAttributes {
    let mut attributes = FileAttributes::new();
    match value {
        Some(Value::Object(map)) => {
            for (code, value) in map {
                if let (Ok(code), Some(value)) = (code.parse::<u32>(), as_u32(value)) {
                    attributes.insert_code(code, value);
                }
            }
        }
        Some(Value::String(text)) if !text.is_empty() => {
            if let Some(parsed) = parse_mapping_text(text) {
                return parsed;
            }
            parse_legacy_bitrate(text, &mut attributes);
            if let Some(seconds) = legacy_length
                .and_then(Value::as_str)
                .and_then(parse_duration)
            {
                attributes.set(FileAttribute::Duration, seconds);
            }
        }
        _ => {}
    }
    attributes
}

fn as_u32(value: &Value) -> Option<u32> {
    as_integer(value).and_then(|value| u32::try_from(value).ok())
}

/// `"{0: 256, 1: 476}"`, written by clients that stringified the mapping.
fn parse_mapping_text(text: &str) -> Option<FileAttributes> {
    let inner = text.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut attributes = FileAttributes::new();
    for pair in inner.split(',').filter(|pair| !pair.trim().is_empty()) {
        let (code, value) = pair.split_once(':')?;
        let code = code.trim().trim_matches(['\'', '"']).parse().ok()?;
        let value = value.trim().parse().ok()?;
        attributes.insert_code(code, value);
    }
    Some(attributes)
}

/// `"320"` or `"238 (vbr)"`.
fn parse_legacy_bitrate(text: &str, attributes: &mut FileAttributes) {
    let is_vbr = text.contains(" (vbr)");
    if let Ok(bitrate) = text.replace(" (vbr)", "").trim().parse::<u32>() {
        attributes.set(FileAttribute::Bitrate, bitrate);
        if is_vbr {
            attributes.set(FileAttribute::Vbr, 1);
        }
    }
}

/// `"m:ss"` or `"h:mm:ss"` to seconds.
fn parse_duration(text: &str) -> Option<u32> {
    if !text.contains(':') {
        return None;
    }
    text.split(':').try_fold(0_u32, |seconds, part| {
        let part: u32 = part.trim().parse().ok()?;
        seconds.checked_mul(60)?.checked_add(part)
    })
}
