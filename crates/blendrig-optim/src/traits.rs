use blendrig_core::{DMat, DVec, Real};
use serde::{Deserialize, Serialize};

use crate::jacobian::forward_difference;

/// Generic non-linear least squares problem with dense parameter/residual vectors.
///
/// The default Jacobian is a forward-difference estimate built from
/// [`NllsProblem::residuals`]; problems with a cheap analytic derivative
/// override it.
pub trait NllsProblem {
    /// Number of parameters in the optimization vector.
    fn num_params(&self) -> usize;
    /// Number of residual rows in the problem.
    fn num_residuals(&self) -> usize;

    /// Residuals for the current parameters.
    fn residuals(&self, x: &DVec) -> DVec;

    /// Jacobian of the residuals for the current parameters.
    fn jacobian(&self, x: &DVec) -> DMat {
        let r0 = self.residuals(x);
        forward_difference(|p| self.residuals(p), x, &r0)
    }

    /// Half the squared residual norm.
    fn cost(&self, x: &DVec) -> Real {
        0.5 * self.residuals(x).norm_squared()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveOptions {
    /// Maximum number of projected LM passes.
    pub max_iters: usize,
    /// Relative tolerance on the objective (cost) reduction.
    pub ftol: Real,
    /// Orthogonality/gradient tolerance.
    pub gtol: Real,
    /// Relative tolerance on parameter updates.
    pub xtol: Real,
    /// Enable verbose solver logging.
    pub verbose: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 200,
            ftol: 1e-10,
            gtol: 1e-10,
            xtol: 1e-10,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    /// Residual evaluations (plain LM) or LM passes (projected LM).
    pub iterations: usize,
    pub final_cost: Real,
    pub converged: bool,
}

/// Per-parameter box `[lower, upper]` enforced by projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxBounds {
    pub lower: Real,
    pub upper: Real,
}

impl BoxBounds {
    pub fn new(lower: Real, upper: Real) -> Self {
        Self { lower, upper }
    }

    /// Clamp every entry of `x` into the box.
    pub fn project(&self, x: &mut DVec) {
        for v in x.iter_mut() {
            *v = v.clamp(self.lower, self.upper);
        }
    }

    pub fn contains(&self, x: &DVec) -> bool {
        x.iter().all(|v| (self.lower..=self.upper).contains(v))
    }
}
