//! JSON file loader for the transfer configuration.
//!
//! # Design
//! - A missing file yields defaults; a malformed file is an error.
//! - Every loaded document is validated before it is returned.
//! - Saving writes a sibling temp file and renames it into place.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::model::TransferConfig;
use crate::validate::validate;

/// Load and validate the configuration stored at `path`.
///
/// # Errors
///
/// Returns an error when the file cannot be read, is not valid JSON for the
/// document, or fails validation.
pub fn load_config(path: &Path) -> ConfigResult<TransferConfig> {
    let config = match fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<TransferConfig>(&bytes)
            .map_err(|source| ConfigError::json("load_config.parse", path, source))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "configuration file missing; using defaults");
            TransferConfig::default()
        }
        Err(err) => return Err(ConfigError::io("load_config.read", path, err)),
    };

    validate(&config)?;
    info!(path = %path.display(), "transfer configuration loaded");
    Ok(config)
}

/// Persist the configuration to `path`, replacing any previous file.
///
/// # Errors
///
/// Returns an error when the document fails validation or cannot be written.
pub fn save_config(path: &Path, config: &TransferConfig) -> ConfigResult<()> {
    validate(config)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|source| ConfigError::io("save_config.create_parent", parent, source))?;
    }

    let payload = serde_json::to_vec_pretty(config)
        .map_err(|source| ConfigError::json("save_config.serialize", path, source))?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, payload)
        .map_err(|source| ConfigError::io("save_config.write", &staging, source))?;
    fs::rename(&staging, path).map_err(|source| ConfigError::io("save_config.rename", path, source))
}
