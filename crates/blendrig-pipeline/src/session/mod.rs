//! Session bookkeeping shared by the orchestrator.

pub mod types;

pub use types::{current_timestamp, LogEntry, Stage};
