//! Log entries recorded while a rig is being solved.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Which stage an entry (or a step callback) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Stage A: per-face deformation gradients.
    Gradient,
    /// Stage T: vertex reconstruction.
    Vertex,
    /// Stage B: per-pose blend weights.
    Weights,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Gradient, Stage::Vertex, Stage::Weights];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Gradient => "gradient",
            Stage::Vertex => "vertex",
            Stage::Weights => "weights",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Lightweight operation log entry.
///
/// Intended for debugging and audit trail, not for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix timestamp of the operation (seconds since epoch).
    pub timestamp: u64,

    /// Operation name (e.g. "bind_source", "init", "gradient").
    pub operation: String,

    /// Iteration the operation ran for, if any.
    pub iteration: Option<usize>,

    pub success: bool,

    /// Optional notes or error message.
    pub notes: Option<String>,
}

impl LogEntry {
    pub fn success(operation: impl Into<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            operation: operation.into(),
            iteration: None,
            success: true,
            notes: None,
        }
    }

    pub fn success_with_notes(operation: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Self::success(operation)
        }
    }

    pub fn failure(operation: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            notes: Some(error.into()),
            ..Self::success(operation)
        }
    }

    /// Tag the entry with the iteration it belongs to.
    pub fn at_iteration(mut self, iteration: usize) -> Self {
        self.iteration = Some(iteration);
        self
    }
}

/// Current Unix timestamp in seconds (0 if the clock predates the epoch).
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
