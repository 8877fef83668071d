#![forbid(unsafe_code)]
#![warn(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Lifecycle event bus for the download spool.
//!
//! The bus provides a typed event enum, sequential identifiers, and replay of
//! recent events for subscribers that attach late. Internally it uses
//! `tokio::broadcast` with a bounded buffer; when the channel overflows the
//! oldest events are dropped.

pub mod payloads;
pub mod routing;

pub use payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};
pub use routing::{EventBus, EventStream};
