//! High-level entry crate for `blendrig`, example-based facial blendshape
//! estimation.
//!
//! Given a *source* rig with known blendshapes and a *target* character for
//! which only a neutral mesh and a handful of example poses exist, `blendrig`
//! estimates the target's blendshapes and the blend weights of its poses by
//! alternating three solvers:
//!
//! - a per-face least-squares fit of deformation gradients,
//! - a sparse reconstruction of vertex positions from those gradients,
//! - a box-constrained Levenberg–Marquardt refit of the pose weights.
//!
//! # Quick Start
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use blendrig::prelude::*;
//! use blendrig::synthetic::{add_blended_poses, bump_rig, mirrored_target};
//!
//! let mut source = bump_rig(8, 8, &[1.0, 0.6]);
//! add_blended_poses(&mut source, &[vec![1.0, 1.0, 0.0], vec![1.0, 0.2, 0.9]])?;
//! let target = mirrored_target(&source)?;
//!
//! let mut solver = RigSolver::new(SolveConfig::default());
//! solver.set_source(source)?;
//! solver.set_target(target)?;
//! solver.solve()?;
//!
//! let rig = solver.target().expect("target is bound");
//! println!("weights: {:?}", rig.all_weights());
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`core`] - Meshes, rigs, deformation gradients, schedules
//! - [`linear`] - Gradient fit and vertex reconstruction
//! - [`optim`] - Non-linear least squares and the weights solver
//! - [`pipeline`] - Configuration and the alternating [`RigSolver`]
//! - [`synthetic`] - Deterministic rigs for tests and demos

// ═══════════════════════════════════════════════════════════════════════════════
// Foundation Crates
// ═══════════════════════════════════════════════════════════════════════════════

/// Meshes, rigs, deformation gradients and parameter schedules.
///
/// Re-exports everything from `blendrig_core`.
pub mod core {
    pub use blendrig_core::*;
}

/// Stage A (gradient fit) and Stage T (vertex reconstruction).
pub mod linear {
    pub use blendrig_linear::*;
}

/// Levenberg–Marquardt backend and Stage B (weights).
pub mod optim {
    pub use blendrig_optim::*;
}

/// Solver configuration, orchestration and the session log.
pub mod pipeline {
    pub use blendrig_pipeline::*;
}

/// Deterministic synthetic rigs.
pub mod synthetic {
    pub use blendrig_core::synthetic::*;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Re-exports (Top-Level)
// ═══════════════════════════════════════════════════════════════════════════════

pub use blendrig_core::{
    ActiveRegion, Blendshape, Gradients, Mesh, Pose, Real, Rig, RigError, Schedule, Weights,
};
pub use blendrig_linear::{GradientSolveOptions, VertexSolveOptions};
pub use blendrig_optim::WeightsSolveOptions;
pub use blendrig_pipeline::{
    LogEntry, RigSolver, SolveConfig, SolveError, SolverState, Stage, StepCallback,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Prelude (Quick Start)
// ═══════════════════════════════════════════════════════════════════════════════

/// Convenient re-exports for common use cases.
///
/// ```no_run
/// use blendrig::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Blendshape, GradientSolveOptions, Mesh, Pose, Real, Rig, RigSolver, Schedule,
        SolveConfig, SolveError, SolverState, Stage, VertexSolveOptions, WeightsSolveOptions,
    };
}
