//! On-disk fixtures: a scratch configuration and shared files to serve.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use slsk_config::TransferConfig;
use slsk_transfer_core::{FileAttributes, SharedFile};
use tempfile::TempDir;

/// Scratch directories laid out like a client profile.
///
/// Everything lives under one [`TempDir`] that is removed on drop.
#[derive(Debug)]
pub struct Workspace {
    root: TempDir,
}

impl Workspace {
    /// Create the scratch tree.
    ///
    /// # Errors
    ///
    /// Returns an error when the temporary directory cannot be created.
    pub fn new() -> Result<Self> {
        let root = TempDir::new()?;
        for dir in ["data", "downloads", "incomplete", "shares"] {
            fs::create_dir_all(root.path().join(dir))?;
        }
        Ok(Self { root })
    }

    /// Root of the scratch tree.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Folder finished downloads land in.
    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.path().join("downloads")
    }

    /// Folder partial downloads are written to.
    #[must_use]
    pub fn incomplete_dir(&self) -> PathBuf {
        self.path().join("incomplete")
    }

    /// Folder holding the persisted transfer lists.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.path().join("data")
    }

    /// Default configuration pointed at this tree.
    #[must_use]
    pub fn config(&self) -> TransferConfig {
        let mut config = TransferConfig {
            data_dir: self.data_dir(),
            ..TransferConfig::default()
        };
        config.downloads.download_dir = self.download_dir();
        config.downloads.incomplete_dir = self.incomplete_dir();
        config
    }

    /// Write `contents` under the shares folder and describe it for a
    /// shares index.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn shared_file(&self, name: &str, contents: &[u8]) -> Result<SharedFile> {
        let real_path = self.path().join("shares").join(name);
        if let Some(parent) = real_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&real_path, contents)?;
        Ok(SharedFile {
            real_path,
            size: contents.len() as u64,
            file_attributes: FileAttributes::new(),
        })
    }

    /// Describe a shared file of `size` bytes that does not exist on disk.
    #[must_use]
    pub fn missing_shared_file(&self, name: &str, size: u64) -> SharedFile {
        SharedFile {
            real_path: self.path().join("shares").join(name),
            size,
            file_attributes: FileAttributes::new(),
        }
    }
}
