//! Solver configuration.
//!
//! Every tunable of the three stages lives in one serde-friendly struct so a
//! whole run can be described by a single JSON document:
//!
//! ```json
//! {
//!   "num_iterations": 4,
//!   "gradient": {
//!     "beta": { "continuous": [
//!       { "iteration": 0, "value": 0.5 },
//!       { "iteration": 10, "value": 0.1 }
//!     ] }
//!   },
//!   "weights": { "lambda": { "constant": 100.0 } }
//! }
//! ```
//!
//! Missing fields fall back to [`SolveConfig::default`].

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use blendrig_linear::{GradientSolveOptions, VertexSolveOptions};
use blendrig_optim::WeightsSolveOptions;
use serde::{Deserialize, Serialize};

use crate::SolveError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveConfig {
    /// Number of A → T → B rounds run by [`RigSolver::solve`](crate::RigSolver::solve).
    pub num_iterations: usize,
    /// Run Stage A and Stage B on the rayon pool. Overrides the per-stage flags.
    pub multithreaded: bool,
    /// Handed to step callbacks verbatim; never read by the solver.
    pub debug_path: Option<String>,
    pub gradient: GradientSolveOptions,
    pub vertex: VertexSolveOptions,
    pub weights: WeightsSolveOptions,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            num_iterations: 10,
            multithreaded: true,
            debug_path: None,
            gradient: GradientSolveOptions::default(),
            vertex: VertexSolveOptions::default(),
            weights: WeightsSolveOptions::default(),
        }
    }
}

impl SolveConfig {
    /// Every regularizer switched off: `β = 0`, no anchors, `λ = 0`.
    pub fn unregularized() -> Self {
        let mut config = Self::default();
        config.gradient = GradientSolveOptions::unregularized();
        config.vertex.fixed_weight = 0.0;
        config.weights.lambda = blendrig_core::Schedule::constant(0.0);
        config
    }

    /// Parse a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails [`SolveConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("failed to parse solver configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read solver configuration {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize solver configuration")
    }

    /// Check the values the stages cannot reject on their own.
    pub fn validate(&self) -> Result<(), SolveError> {
        let w = &self.weights;
        if !(w.min_weight <= w.max_weight) {
            return Err(SolveError::InvalidConfig(format!(
                "weights.min_weight {} exceeds weights.max_weight {}",
                w.min_weight, w.max_weight
            )));
        }
        if !(self.vertex.fixed_weight >= 0.0 && self.vertex.fixed_weight.is_finite()) {
            return Err(SolveError::InvalidConfig(format!(
                "vertex.fixed_weight must be finite and non-negative, got {}",
                self.vertex.fixed_weight
            )));
        }
        if self.vertex.max_fixed == Some(0) && self.vertex.fixed_weight > 0.0 {
            log::warn!("vertex.max_fixed is 0: fixed-vertex anchors are disabled");
        }
        Ok(())
    }

    /// Stage options with the global `multithreaded` flag applied.
    pub(crate) fn gradient_options(&self) -> GradientSolveOptions {
        GradientSolveOptions {
            multithreaded: self.multithreaded,
            ..self.gradient.clone()
        }
    }

    pub(crate) fn weights_options(&self) -> WeightsSolveOptions {
        WeightsSolveOptions {
            multithreaded: self.multithreaded,
            ..self.weights.clone()
        }
    }
}
