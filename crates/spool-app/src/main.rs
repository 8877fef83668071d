#![forbid(unsafe_code)]
#![warn(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Binary entrypoint for the download spool daemon.

use spool_app::{AppResult, run_app};

/// Runs the selected command and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
