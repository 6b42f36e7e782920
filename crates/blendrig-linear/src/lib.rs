//! Linear least-squares stages of the rig solver.
//!
//! - [`GradientSolver`]: per-face estimation of the unknown target
//!   deformation gradients (dense Cholesky per face, faces in parallel).
//! - [`VertexSolver`]: per-blendshape reconstruction of vertex positions from
//!   the gradients (sparse LDLᵀ of the normal equations, cached).
//!
//! Both stages read the active region of the target rig and leave faces and
//! vertices outside of it at their previous values.

mod gradient;
mod vertex;

pub use gradient::{GradientSolveError, GradientSolveOptions, GradientSolver};
pub use vertex::{VertexSolveError, VertexSolveOptions, VertexSolver};
