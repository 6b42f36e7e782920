//! Non-linear least-squares layer of the rig solver.
//!
//! - [`NllsProblem`] and [`SolveOptions`]: backend-agnostic problem interface.
//! - [`LmBackend`]: Levenberg–Marquardt via `levenberg-marquardt`, with a
//!   projected variant for box constraints.
//! - [`WeightsSolver`]: per-pose estimation of blend weights against the
//!   current target blendshapes.

pub mod jacobian;

mod backend_lm;
mod traits;
mod weights;

pub use backend_lm::{LmBackend, LmError};
pub use traits::{BoxBounds, NllsProblem, SolveOptions, SolveReport};
pub use weights::{
    blendshape_basis, pose_offsets, PoseWeightsProblem, WeightsSolveError, WeightsSolveOptions,
    WeightsSolver,
};
