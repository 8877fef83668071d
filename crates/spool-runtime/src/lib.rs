#![forbid(unsafe_code)]
#![warn(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Persistence layer for the queue snapshot.
//!
//! The snapshot is a single JSON document rewritten in full on every save.
//! Loading never fails: a missing or unreadable file yields an empty snapshot
//! so a damaged state file cannot block startup.

pub mod error;
pub mod store;

pub use error::{RuntimeError, RuntimeResult};
pub use store::{StateStore, atomic_write};
