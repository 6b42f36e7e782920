//! Per-pose blend weight estimation.
//!
//! For pose `p` with non-neutral weights `w` the objective is
//!
//! ```text
//! Σ_v ‖(B w − c_p)_v‖² + λ ‖w − ŵ_p‖²
//! ```
//!
//! where `B` stacks the active-vertex offsets of every non-neutral target
//! blendshape (one column per blendshape), `c_p` holds the pose offsets and
//! `ŵ_p` the weights the pose had when the solver was initialized. The
//! residual vector has one entry per active vertex (Euclidean norm of the
//! vertex misfit) plus one per weight (`√λ (w_i − ŵ_i)`). Weights are kept in
//! `[min_weight, max_weight]` by the projected LM backend.

use blendrig_core::{segment_len, DMat, DVec, Real, Rig, Schedule, Weights};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BoxBounds, LmBackend, NllsProblem, SolveOptions, SolveReport};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WeightsSolveError {
    #[error("weights solver is not initialized")]
    NotInitialized,
    #[error("target rig is incompatible: {0}")]
    Incompatible(String),
    #[error("invalid weights solver options: {0}")]
    InvalidOptions(String),
    #[error("pose {pose}: {reason}")]
    Optimizer { pose: usize, reason: String },
    #[error("{failed} of {total} poses failed, first: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: Box<WeightsSolveError>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsSolveOptions {
    /// Strength `λ` of the pull toward the initial weights.
    pub lambda: Schedule,
    /// Number of projected LM passes per pose.
    pub max_iterations: usize,
    pub min_weight: Real,
    pub max_weight: Real,
    pub ftol: Real,
    pub xtol: Real,
    pub gtol: Real,
    /// Process poses on the rayon pool.
    pub multithreaded: bool,
}

impl Default for WeightsSolveOptions {
    fn default() -> Self {
        Self {
            // literal breakpoints are finite and non-empty
            lambda: Schedule::continuous([(0, 1000.0), (10, 100.0)]).unwrap_or_default(),
            max_iterations: 10,
            min_weight: 0.0,
            max_weight: 1.0,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            multithreaded: true,
        }
    }
}

impl WeightsSolveOptions {
    fn validate(&self) -> Result<(), WeightsSolveError> {
        if !(self.min_weight <= self.max_weight) {
            return Err(WeightsSolveError::InvalidOptions(format!(
                "min_weight {} exceeds max_weight {}",
                self.min_weight, self.max_weight
            )));
        }
        Ok(())
    }

    fn bounds(&self) -> BoxBounds {
        BoxBounds::new(self.min_weight, self.max_weight)
    }

    fn solve_options(&self) -> SolveOptions {
        SolveOptions {
            max_iters: self.max_iterations,
            ftol: self.ftol,
            gtol: self.gtol,
            xtol: self.xtol,
            verbose: false,
        }
    }
}

/// Offsets of the active vertices of every non-neutral blendshape,
/// `3 · num_active_vertices × (N − 1)`.
pub fn blendshape_basis(rig: &Rig) -> DMat {
    let num_active = rig.num_active_vertices();
    let neutral = rig.neutral();
    let mut basis = DMat::zeros(3 * num_active, rig.num_blendshapes().saturating_sub(1));
    for bs in 1..rig.num_blendshapes() {
        let mesh = rig.blendshape(bs).mesh();
        for a in 0..num_active {
            let v = rig.vertex(a);
            let d = mesh.position(v) - neutral.position(v);
            for coord in 0..3 {
                basis[(3 * a + coord, bs - 1)] = d[coord];
            }
        }
    }
    basis
}

/// Active-vertex offsets of one pose.
pub fn pose_offsets(rig: &Rig, pose: usize) -> DVec {
    let num_active = rig.num_active_vertices();
    let neutral = rig.neutral();
    let mesh = rig.pose(pose).mesh();
    let mut c = DVec::zeros(3 * num_active);
    for a in 0..num_active {
        let v = rig.vertex(a);
        let d = mesh.position(v) - neutral.position(v);
        for coord in 0..3 {
            c[3 * a + coord] = d[coord];
        }
    }
    c
}

/// Weight-fit problem of one pose.
#[derive(Debug)]
pub struct PoseWeightsProblem<'a> {
    basis: &'a DMat,
    observed: DVec,
    prior: DVec,
    sqrt_lambda: Real,
}

impl<'a> PoseWeightsProblem<'a> {
    pub fn new(basis: &'a DMat, observed: DVec, prior: DVec, lambda: Real) -> Self {
        debug_assert_eq!(basis.nrows(), observed.len());
        debug_assert_eq!(basis.ncols(), prior.len());
        Self {
            basis,
            observed,
            prior,
            sqrt_lambda: lambda.max(0.0).sqrt(),
        }
    }

    fn num_vertices(&self) -> usize {
        self.observed.len() / 3
    }
}

impl NllsProblem for PoseWeightsProblem<'_> {
    fn num_params(&self) -> usize {
        self.prior.len()
    }

    fn num_residuals(&self) -> usize {
        self.num_vertices() + self.prior.len()
    }

    fn residuals(&self, x: &DVec) -> DVec {
        let misfit = self.basis * x - &self.observed;
        let num_vertices = self.num_vertices();
        let mut r = DVec::zeros(self.num_residuals());
        for v in 0..num_vertices {
            r[v] = misfit.fixed_rows::<3>(3 * v).norm();
        }
        for i in 0..self.prior.len() {
            r[num_vertices + i] = self.sqrt_lambda * (x[i] - self.prior[i]);
        }
        r
    }
}

#[derive(Debug, Clone, Default)]
pub struct WeightsSolver {
    options: WeightsSolveOptions,
    /// Weight vectors (neutral entry dropped) captured at `init`.
    prior: Option<Vec<DVec>>,
}

impl WeightsSolver {
    pub fn new(options: WeightsSolveOptions) -> Self {
        Self {
            options,
            prior: None,
        }
    }

    pub fn options(&self) -> &WeightsSolveOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.prior.is_some()
    }

    /// Capture the current pose weights as the regularization targets.
    pub fn init(&mut self, target: &Rig) -> Result<(), WeightsSolveError> {
        self.options.validate()?;
        target
            .validate()
            .map_err(|e| WeightsSolveError::Incompatible(e.to_string()))?;
        let prior = target
            .poses()
            .iter()
            .map(|p| DVec::from_iterator(p.weights().len() - 1, p.weights()[1..].iter().copied()))
            .collect();
        self.prior = Some(prior);
        debug!("weights solver initialized: {} poses", target.num_poses());
        Ok(())
    }

    /// Regularization targets of one pose (neutral entry excluded).
    pub fn prior(&self, pose: usize) -> Option<&DVec> {
        self.prior.as_ref().and_then(|p| p.get(pose))
    }

    /// Re-estimate the non-neutral weights of every pose.
    ///
    /// Poses whose optimizer fails keep their weights; all other poses are
    /// updated before the failures are reported.
    pub fn solve(
        &self,
        iteration: usize,
        target: &mut Rig,
    ) -> Result<Vec<SolveReport>, WeightsSolveError> {
        let prior = self
            .prior
            .as_ref()
            .ok_or(WeightsSolveError::NotInitialized)?;
        target
            .validate()
            .map_err(|e| WeightsSolveError::Incompatible(e.to_string()))?;
        if prior.len() != target.num_poses() {
            return Err(WeightsSolveError::Incompatible(format!(
                "initialized for {} poses, target has {}",
                prior.len(),
                target.num_poses()
            )));
        }

        let lambda = self.options.lambda.at(iteration);
        info!("weights solver [{}]: lambda = {}", iteration, lambda);

        if target.num_blendshapes() < 2 || target.num_poses() == 0 {
            return Ok(Vec::new());
        }

        let basis = blendshape_basis(target);
        let rig: &Rig = target;
        let bounds = self.options.bounds();
        let opts = self.options.solve_options();
        let poses: Vec<usize> = (0..rig.num_poses()).collect();

        let solve_segment = |worker: usize, segment: &[usize]| {
            if let (Some(first), Some(last)) = (segment.first(), segment.last()) {
                debug!(
                    "weights worker {}: poses {}..={} ({})",
                    worker,
                    first,
                    last,
                    segment.len()
                );
            }
            segment
                .iter()
                .map(|&pose| {
                    let problem = PoseWeightsProblem::new(
                        &basis,
                        pose_offsets(rig, pose),
                        prior[pose].clone(),
                        lambda,
                    );
                    let w = rig.weights(pose);
                    let x0 = DVec::from_iterator(w.len() - 1, w[1..].iter().copied());
                    let result = LmBackend
                        .solve_projected(&problem, x0, &bounds, &opts)
                        .map_err(|e| WeightsSolveError::Optimizer {
                            pose,
                            reason: e.to_string(),
                        });
                    (pose, result)
                })
                .collect::<Vec<_>>()
        };

        let results = if self.options.multithreaded && poses.len() > 1 {
            let segment = segment_len(poses.len(), rayon::current_num_threads());
            poses
                .par_chunks(segment)
                .enumerate()
                .flat_map_iter(|(worker, chunk)| solve_segment(worker, chunk))
                .collect::<Vec<_>>()
        } else {
            solve_segment(0, &poses)
        };

        let total = results.len();
        let mut reports = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (pose, result) in results {
            match result {
                Ok((x, report)) => {
                    if !report.converged {
                        warn!(
                            "weights solver [{}]: pose {} did not converge (cost {})",
                            iteration, pose, report.final_cost
                        );
                    }
                    write_weights(target.weights_mut(pose), &x);
                    reports.push(report);
                }
                Err(e) => {
                    error!("weights solver [{}]: {}", iteration, e);
                    failures.push(e);
                }
            }
        }

        match failures.len() {
            0 => Ok(reports),
            failed => Err(WeightsSolveError::Partial {
                failed,
                total,
                first: Box::new(failures.swap_remove(0)),
            }),
        }
    }
}

/// Replace entries `1..N` of a pose weight vector; the neutral entry is kept.
fn write_weights(weights: &mut Weights, x: &DVec) {
    for (w, &v) in weights.iter_mut().skip(1).zip(x.iter()) {
        *w = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blendrig_core::synthetic::{add_blended_poses, bump_rig};

    #[test]
    fn residual_layout_is_vertices_then_weights() {
        let basis = DMat::from_row_slice(6, 1, &[1.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let observed = DVec::from_vec(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let prior = DVec::from_vec(vec![0.5]);
        let problem = PoseWeightsProblem::new(&basis, observed, prior, 4.0);
        assert_eq!(problem.num_residuals(), 3);

        let r = problem.residuals(&DVec::from_vec(vec![1.0]));
        assert!((r[0] - 1.0).abs() < 1e-12);
        assert!((r[1] - 2.0).abs() < 1e-12);
        assert!((r[2] - 1.0).abs() < 1e-12, "sqrt(4) * (1 - 0.5)");
    }

    #[test]
    fn neutral_weight_is_untouched() {
        let mut weights = vec![1.0, 0.2, 0.3];
        write_weights(&mut weights, &DVec::from_vec(vec![0.7, 0.9]));
        assert_eq!(weights, vec![1.0, 0.7, 0.9]);
    }

    #[test]
    fn solve_requires_init() {
        let mut rig = bump_rig(3, 3, &[1.0]);
        add_blended_poses(&mut rig, &[vec![1.0, 0.5]]).unwrap();
        let solver = WeightsSolver::default();
        assert_eq!(
            solver.solve(0, &mut rig),
            Err(WeightsSolveError::NotInitialized)
        );
    }

    #[test]
    fn basis_columns_are_blendshape_offsets() {
        let rig = bump_rig(4, 4, &[1.0, 0.5]);
        let basis = blendshape_basis(&rig);
        assert_eq!(basis.shape(), (48, 2));
        let offsets = rig.blendshape(2).mesh().offsets_from(rig.neutral());
        for v in 0..16 {
            for coord in 0..3 {
                assert_eq!(basis[(3 * v + coord, 1)], offsets[v][coord]);
            }
        }
    }
}
