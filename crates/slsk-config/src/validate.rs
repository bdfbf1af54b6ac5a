//! Validation rules applied after a configuration document is parsed.

use crate::error::{ConfigError, ConfigResult};
use crate::model::TransferConfig;

/// Check cross-field constraints the type system cannot express.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] describing the first violation found.
pub fn validate(config: &TransferConfig) -> ConfigResult<()> {
    if config.uploads.use_upload_slots && config.uploads.upload_slots == 0 {
        return Err(ConfigError::invalid(
            "uploads",
            "upload_slots",
            "must_be_positive",
        ));
    }
    if config.uploads.upload_check_interval_secs == 0 {
        return Err(ConfigError::invalid(
            "uploads",
            "upload_check_interval_secs",
            "must_be_positive",
        ));
    }
    if config.network.request_timeout_secs == 0 {
        return Err(ConfigError::invalid(
            "network",
            "request_timeout_secs",
            "must_be_positive",
        ));
    }
    if config.network.save_interval_secs == 0 {
        return Err(ConfigError::invalid(
            "network",
            "save_interval_secs",
            "must_be_positive",
        ));
    }
    if config.downloads.retry_interval_secs == 0 {
        return Err(ConfigError::invalid(
            "downloads",
            "retry_interval_secs",
            "must_be_positive",
        ));
    }
    if config.downloads.place_in_queue_interval_secs == 0 {
        return Err(ConfigError::invalid(
            "downloads",
            "place_in_queue_interval_secs",
            "must_be_positive",
        ));
    }
    if config.downloads.download_dir.as_os_str().is_empty() {
        return Err(ConfigError::invalid("downloads", "download_dir", "empty"));
    }
    if config.downloads.incomplete_dir.as_os_str().is_empty() {
        return Err(ConfigError::invalid("downloads", "incomplete_dir", "empty"));
    }
    if config
        .uploads
        .preferred_extensions
        .iter()
        .any(|extension| extension.is_empty() || extension.starts_with('.'))
    {
        return Err(ConfigError::invalid(
            "uploads",
            "preferred_extensions",
            "bare_extension_expected",
        ));
    }
    if config
        .downloads
        .filters
        .iter()
        .any(|filter| filter.pattern.trim().is_empty())
    {
        return Err(ConfigError::invalid("downloads", "filters", "empty_pattern"));
    }
    Ok(())
}
