#![forbid(unsafe_code)]
#![warn(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Configuration for the download spool.
//!
//! Values are layered: built-in defaults, then an optional JSON document named
//! by `SPOOL_CONFIG`, then individual `SPOOL_*` environment overrides. The
//! merged result is validated before it is handed to the application.

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_PATH_ENV, load_file, load_from_env, load_with};
pub use model::{DownloadPolicy, LogOutput, LoggingSettings, SpoolConfig, StateConfig};
