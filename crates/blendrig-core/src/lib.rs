//! Core geometry and data-model primitives for `blendrig`.
//!
//! This crate provides the building blocks shared by every solver stage in
//! the workspace:
//!
//! - linear algebra type aliases (`Real`, `Vec3`, `Pt3`, `Mat3`, ...),
//! - triangle meshes and the rig model (neutral, blendshapes, poses, active region),
//! - per-face deformation gradients,
//! - iteration-keyed hyperparameter schedules.
//!
//! # Modules
//!
//! - \[`math`\]: type aliases and 3x3 frame flattening.
//! - \[`mesh`\]: triangulated surfaces and adjacency queries.
//! - \[`rig`\]: blendshapes, poses and active-region index mapping.
//! - \[`gradients`\]: deformation-gradient frames and affine maps.
//! - \[`schedule`\]: constant, step and piecewise-linear schedules.
//! - \[`synthetic`\]: deterministic synthetic rigs (tests/benchmarks).
//!
//! # Example
//!
//! ```
//! use blendrig_core::{synthetic, Gradients, Schedule};
//!
//! let mut rig = synthetic::bump_rig(5, 5, &[1.0]);
//! synthetic::add_blended_poses(&mut rig, &[vec![1.0, 0.5]]).unwrap();
//! let gradients = Gradients::source(&rig);
//! assert_eq!(gradients.num_faces(), rig.num_faces());
//!
//! let beta = Schedule::continuous([(0, 0.5), (10, 0.1)]).unwrap();
//! assert!((beta.value(5) - 0.3).abs() < 1e-12);
//! ```

/// Linear algebra type aliases and helpers.
mod math;
/// Triangle meshes.
mod mesh;
/// Rig data model.
mod rig;
/// Deformation gradients.
mod gradients;
/// Hyperparameter schedules.
mod schedule;
/// Deterministic synthetic rig generation helpers.
///
/// Used in workspace tests and useful for regression testing of the solver
/// stages without any mesh I/O.
pub mod synthetic;

pub use gradients::*;
pub use math::*;
pub use mesh::*;
pub use rig::*;
pub use schedule::*;
