//! Shared domain types for the aicoder flow orchestrator.
//!
//! `models` holds the rows the orchestrator persists (flows, tasks, terminal
//! log lines) and `events` holds the notifications it fans out to live
//! subscribers.

pub mod events;
pub mod models;

pub use events::{Event, EventKind, Topic};
pub use models::*;
