#![forbid(unsafe_code)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Configuration for the transfer engine.
//!
//! Layout: `model.rs` (typed document), `defaults.rs` (default values),
//! `validate.rs` (cross-field checks), `loader.rs` (JSON file IO).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, save_config};
pub use model::{
    Buddy, DownloadFilter, DownloadSettings, NetworkSettings, QueueMode, QuotaAccounting,
    TransferConfig, UploadSettings,
};
pub use validate::validate;
