use blendrig_core::RigError;
use blendrig_linear::{GradientSolveError, VertexSolveError};
use blendrig_optim::WeightsSolveError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    /// Source or target rig missing, invalid or mismatched.
    #[error("binding failure: {0}")]
    Binding(String),
    #[error(transparent)]
    Rig(#[from] RigError),
    #[error("gradient stage failed: {0}")]
    Gradient(#[from] GradientSolveError),
    #[error("vertex stage failed: {0}")]
    Vertex(#[from] VertexSolveError),
    #[error("weights stage failed: {0}")]
    Weights(#[from] WeightsSolveError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
