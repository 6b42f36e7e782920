//! Alternating blendshape estimation.
//!
//! [`RigSolver`] binds a source rig (known blendshapes) and a target rig
//! (neutral, poses and initial weights) and alternates three stages until
//! the target blendshapes and pose weights agree with the example poses.
//!
//! ```no_run
//! use blendrig_pipeline::{RigSolver, SolveConfig, Stage};
//! # fn main() -> anyhow::Result<()> {
//! # let source: blendrig_core::Rig = unimplemented!();
//! # let target: blendrig_core::Rig = unimplemented!();
//! let config = SolveConfig::from_json_file("solve.json")?;
//! let mut solver = RigSolver::new(config);
//! solver.set_source(source)?;
//! solver.set_target(target)?;
//! solver.set_step_callback(
//!     Stage::Weights,
//!     Box::new(|iteration: usize, rig: &blendrig_core::Rig, _path: &str| {
//!         println!("round {iteration}: {:?}", rig.all_weights());
//!     }),
//! );
//! solver.solve()?;
//! let rig = solver.take_target();
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
pub mod session;
mod solver;

pub use config::SolveConfig;
pub use error::SolveError;
pub use session::{LogEntry, Stage};
pub use solver::{RigSolver, SolverState, StepCallback};
