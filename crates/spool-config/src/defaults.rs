//! Default values for every configuration field.
//!
//! # Design
//! - Tunables observed in production (cooldown, throttle) live here rather
//!   than inside the supervisor so they can be overridden per deployment.

/// State file written next to the working directory.
pub const STATE_PATH: &str = "persistence.json";
/// Directory transfers are saved to when a request does not name one.
pub const SAVE_PATH: &str = "downloads";
/// Poll interval while a transfer is running.
pub const POLL_INTERVAL_MS: u64 = 2_000;
/// Poll interval while paused; shorter so resume feels immediate.
pub const PAUSED_POLL_INTERVAL_MS: u64 = 1_000;
/// How long a transfer may wait for metadata before it is requeued.
pub const METADATA_TIMEOUT_SECS: u64 = 60;
/// Delay before retrying a timed-out job that is alone in its queue.
pub const REQUEUE_COOLDOWN_SECS: u64 = 60;
/// Minimum spacing between progress renders for one job.
pub const PROGRESS_THROTTLE_SECS: u64 = 5;
/// Upper bound on a single render call.
pub const RENDER_TIMEOUT_SECS: u64 = 10;
/// Log level used when `RUST_LOG` is not set.
pub const LOG_LEVEL: &str = "info";
