use blendrig_core::{DMat, DVec, Real};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use log::debug;
use nalgebra::{storage::Owned, Dyn};
use thiserror::Error;

use crate::{BoxBounds, NllsProblem, SolveOptions, SolveReport};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LmError {
    #[error("optimizer stopped: {0}")]
    Terminated(String),
}

struct LmWrapper<'a, P: NllsProblem> {
    problem: &'a P,
    params: DVec,
}

impl<'a, P: NllsProblem> LeastSquaresProblem<Real, Dyn, Dyn> for LmWrapper<'a, P> {
    type ResidualStorage = Owned<Real, Dyn>;
    type JacobianStorage = Owned<Real, Dyn, Dyn>;
    type ParameterStorage = Owned<Real, Dyn>;

    fn set_params(&mut self, x: &DVec) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVec {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVec> {
        let r = self.problem.residuals(&self.params);
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMat> {
        Some(self.problem.jacobian(&self.params))
    }
}

#[derive(Debug, Default, Clone)]
pub struct LmBackend;

impl LmBackend {
    /// One short pass per call: the box is re-applied between passes.
    fn minimizer(opts: &SolveOptions) -> LevenbergMarquardt<Real> {
        LevenbergMarquardt::new()
            .with_ftol(opts.ftol)
            .with_xtol(opts.xtol)
            .with_gtol(opts.gtol)
            .with_patience(1)
    }

    /// Box-constrained minimization by projection.
    ///
    /// Runs up to `opts.max_iters` short LM passes (patience 1), clamping the
    /// parameters into `bounds` after every pass. Stops early once a pass
    /// converges or no further improvement is possible. The result always lies
    /// inside the box.
    pub fn solve_projected<P: NllsProblem>(
        &self,
        problem: &P,
        mut x: DVec,
        bounds: &BoxBounds,
        opts: &SolveOptions,
    ) -> Result<(DVec, SolveReport), LmError> {
        bounds.project(&mut x);
        let lm = Self::minimizer(opts);

        let mut converged = false;
        let mut passes = 0;
        for _ in 0..opts.max_iters.max(1) {
            passes += 1;
            let wrapper = LmWrapper {
                problem,
                params: x.clone(),
            };
            let (wrapper, report) = lm.minimize(wrapper);
            x = wrapper.params;
            bounds.project(&mut x);

            if opts.verbose {
                debug!(
                    "projected LM pass {}: {:?}, cost {}",
                    passes, report.termination, report.objective_function
                );
            }

            match report.termination {
                t if t.was_successful() => {
                    converged = true;
                    break;
                }
                TerminationReason::NoImprovementPossible(_) => {
                    converged = true;
                    break;
                }
                TerminationReason::LostPatience => {}
                other => return Err(LmError::Terminated(format!("{other:?}"))),
            }
        }

        let final_cost = problem.cost(&x);
        Ok((
            x,
            SolveReport {
                iterations: passes,
                final_cost,
                converged,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `r = A x - b` with a numeric Jacobian.
    #[derive(Debug)]
    struct LinearProblem {
        a: DMat,
        b: DVec,
    }

    impl NllsProblem for LinearProblem {
        fn num_params(&self) -> usize {
            self.a.ncols()
        }

        fn num_residuals(&self) -> usize {
            self.a.nrows()
        }

        fn residuals(&self, x: &DVec) -> DVec {
            &self.a * x - &self.b
        }
    }

    fn problem(target: &[Real]) -> LinearProblem {
        let a = DMat::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 2.0, 1.0, 1.0]);
        let b = &a * DVec::from_column_slice(target);
        LinearProblem { a, b }
    }

    #[test]
    fn wide_box_converges_from_a_distant_start() {
        let p = problem(&[3.0, -1.0]);
        let bounds = BoxBounds::new(-100.0, 100.0);
        let opts = SolveOptions {
            max_iters: 50,
            ..SolveOptions::default()
        };
        let (x, report) = LmBackend
            .solve_projected(&p, DVec::from_element(2, 10.0), &bounds, &opts)
            .unwrap();
        assert!(
            (x[0] - 3.0).abs() < 1e-6 && (x[1] + 1.0).abs() < 1e-6,
            "expected optimizer to reach (3, -1), got {x}"
        );
        assert!(report.converged, "no convergence reported: {report:?}");
        assert!(report.iterations > 0 && report.iterations <= 50);
    }

    #[test]
    fn projected_solution_inside_box_matches_unconstrained() {
        let p = problem(&[0.25, 0.75]);
        let bounds = BoxBounds::new(0.0, 1.0);
        let opts = SolveOptions {
            max_iters: 20,
            ..SolveOptions::default()
        };
        let (x, report) = LmBackend
            .solve_projected(&p, DVec::from_element(2, 0.5), &bounds, &opts)
            .unwrap();
        assert!((x[0] - 0.25).abs() < 1e-6, "x0 = {}", x[0]);
        assert!((x[1] - 0.75).abs() < 1e-6, "x1 = {}", x[1]);
        assert!(report.final_cost < 1e-10, "cost {}", report.final_cost);
    }

    #[test]
    fn projected_solution_stays_in_box() {
        let p = problem(&[2.0, -0.5]);
        let bounds = BoxBounds::new(0.0, 1.0);
        let opts = SolveOptions {
            max_iters: 10,
            ..SolveOptions::default()
        };
        let (x, _) = LmBackend
            .solve_projected(&p, DVec::from_element(2, 5.0), &bounds, &opts)
            .unwrap();
        assert!(bounds.contains(&x), "left the box: {x}");
    }
}
