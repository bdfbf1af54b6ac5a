//! Download file naming and finalization.
//!
//! # Design
//! - Names are derived from the last component of the virtual path with
//!   characters that are illegal on common filesystems replaced.
//! - Basenames are capped at 255 bytes. Truncation drops whole characters
//!   and keeps the extension when it fits.
//! - Incomplete files carry an md5 of `virtual_path + username` so a partial
//!   file is found again after a restart.
//! - Finalization renames into place and falls back to copy + remove when
//!   the rename fails (typically across devices).

use std::fs;
use std::path::{Path, PathBuf};

use slsk_config::DownloadSettings;
use slsk_transfer_core::{
    FinalizeJob, FinalizeOutcome, TransferError, TransferResult, virtual_basename,
};
use tracing::{debug, info};

/// Largest basename written to disk, in bytes.
pub const MAX_BASENAME_BYTES: usize = 255;

const INCOMPLETE_PREFIX: &str = "INCOMPLETE";
const ILLEGAL_FILE_CHARS: [char; 9] = ['?', ':', '>', '<', '|', '*', '"', '\\', '/'];
const REPLACEMENT_CHAR: char = '_';

/// Replace characters that cannot appear in a file name.
#[must_use]
pub fn clean_file_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ILLEGAL_FILE_CHARS.contains(&ch) {
                REPLACEMENT_CHAR
            } else {
                ch
            }
        })
        .collect()
}

/// Basename used for the finished download of `virtual_path`.
#[must_use]
pub fn download_basename(virtual_path: &str) -> String {
    fit_basename("", &clean_file_name(virtual_basename(virtual_path)))
}

/// Path of the partial file for a download.
#[must_use]
pub fn incomplete_path(incomplete_dir: &Path, username: &str, virtual_path: &str) -> PathBuf {
    let digest = md5::compute(format!("{virtual_path}{username}").as_bytes());
    let prefix = format!("{INCOMPLETE_PREFIX}{digest:x}");
    let basename = clean_file_name(virtual_basename(virtual_path));
    incomplete_dir.join(fit_basename(&prefix, &basename))
}

/// Folder a download lands in when the user did not pick one.
#[must_use]
pub fn default_download_folder(settings: &DownloadSettings, username: &str) -> PathBuf {
    if settings.username_subfolders {
        settings.download_dir.join(clean_file_name(username))
    } else {
        settings.download_dir.clone()
    }
}

/// Earlier finished copy of a download: a file named like the download (or
/// one of its numbered variants) with exactly `size` bytes.
#[must_use]
pub fn existing_download(folder: &Path, basename: &str, size: u64) -> Option<PathBuf> {
    let mut candidates = numbered_names(basename).map(|name| folder.join(name));
    loop {
        let candidate = candidates.next()?;
        let metadata = fs::metadata(&candidate).ok()?;
        if metadata.is_file() && metadata.len() == size {
            return Some(candidate);
        }
    }
}

/// First path in `folder` named `basename`, `stem (1).ext`, `stem (2).ext`…
/// that does not exist yet.
#[must_use]
pub fn unique_destination(folder: &Path, basename: &str) -> PathBuf {
    numbered_names(basename)
        .map(|name| folder.join(name))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| folder.join(basename))
}

/// Move a completed download into place.
#[must_use]
pub fn finalize_download(job: &FinalizeJob) -> FinalizeOutcome {
    match finalize(job) {
        Ok(final_path) => FinalizeOutcome::Moved { final_path },
        Err(err) => FinalizeOutcome::Failed {
            message: match &err {
                TransferError::Io {
                    operation, source, ..
                } => format!("{operation}: {source}"),
                other => other.to_string(),
            },
        },
    }
}

fn finalize(job: &FinalizeJob) -> TransferResult<PathBuf> {
    fs::create_dir_all(&job.folder_path).map_err(|source| {
        TransferError::io("finalize.create_folder", &job.folder_path, source)
    })?;
    let destination = unique_destination(&job.folder_path, &job.basename);
    move_file(&job.incomplete_path, &destination)?;
    info!(
        transfer_id = %job.transfer_id,
        path = %destination.display(),
        "download moved into place"
    );
    Ok(destination)
}

fn move_file(source: &Path, destination: &Path) -> TransferResult<()> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                error = %rename_err,
                source = %source.display(),
                "rename failed; copying instead"
            );
            fs::copy(source, destination)
                .map_err(|err| TransferError::io("finalize.copy", destination, err))?;
            fs::remove_file(source)
                .map_err(|err| TransferError::io("finalize.remove_incomplete", source, err))
        }
    }
}

fn numbered_names(basename: &str) -> impl Iterator<Item = String> + '_ {
    let (stem, extension) = split_extension(basename);
    std::iter::once(basename.to_string())
        .chain((1_u32..).map(move |counter| format!("{stem} ({counter}){extension}")))
}

/// `prefix + stem + extension`, shortened to [`MAX_BASENAME_BYTES`].
fn fit_basename(prefix: &str, basename: &str) -> String {
    let (stem, extension) = split_extension(basename);
    let room = MAX_BASENAME_BYTES.saturating_sub(prefix.len());
    match room.checked_sub(extension.len()) {
        Some(stem_room) => format!("{prefix}{}{extension}", truncate_bytes(stem, stem_room)),
        None => format!("{prefix}{}", truncate_bytes(extension, room)),
    }
}

/// Split at the last dot, ignoring leading dots (`.hidden` has no extension).
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(index) if name[..index].chars().any(|ch| ch != '.') => name.split_at(index),
        _ => (name, ""),
    }
}

fn truncate_bytes(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
