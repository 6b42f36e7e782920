//! Deformation-gradient estimation for unknown target blendshapes.
//!
//! For every active face `f` the unknowns are the frame deltas `X_1..X_{N-1}`
//! (flattened column-major, 9 scalars each). Two row groups make up the
//! per-face system `A x = c`:
//!
//! - fit, one 9-row block per pose `p`:
//!   `Σ_i w_{p,i} X_i = P_{p,f} - M_{0,f}`
//! - regularization, one 9-row block per pose `p` and blendshape `i`:
//!   `ω_{i,f} β X_i = ω_{i,f} β M*_{i,f}`
//!
//! with `ω = ((1 + ‖S_i‖) / (k + ‖S_i‖))^θ` from the source frame delta and
//! `M* = ((S_0 + S_i) S_0⁻¹) T_0 - T_0`. The normal equations are solved with
//! a dense Cholesky factorization. Faces are independent and are processed in
//! contiguous segments on the rayon pool.

use blendrig_core::{
    flatten_frame, segment_len, unflatten_frame, DMat, DVec, Gradients, Mat3, Real, Rig,
    Schedule, FRAME_SIZE,
};
use log::{debug, error, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GradientSolveError {
    #[error("gradient solver is not initialized")]
    NotInitialized,
    #[error("source and target rigs are incompatible: {0}")]
    Incompatible(String),
    #[error("face {face}: normal equations are not positive definite")]
    Factorization { face: usize },
    #[error("{failed} of {total} faces failed, first: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: Box<GradientSolveError>,
    },
}

/// Schedules driving the gradient fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientSolveOptions {
    /// Offset `k` of the regularization confidence weight.
    pub k: Schedule,
    /// Exponent `θ` of the regularization confidence weight.
    pub theta: Schedule,
    /// Regularization strength `β`.
    pub beta: Schedule,
    /// Process faces on the rayon pool.
    pub multithreaded: bool,
}

impl Default for GradientSolveOptions {
    fn default() -> Self {
        Self {
            k: Schedule::constant(0.1),
            theta: Schedule::constant(2.0),
            // literal breakpoints are finite and non-empty
            beta: Schedule::continuous([(0, 0.5), (10, 0.1)]).unwrap_or_default(),
            multithreaded: true,
        }
    }
}

impl GradientSolveOptions {
    /// Options with the regularization switched off (`β = 0`).
    pub fn unregularized() -> Self {
        Self {
            beta: Schedule::constant(0.0),
            ..Self::default()
        }
    }
}

/// Per-face data derived once from the source rig.
#[derive(Debug, Clone)]
struct GradientState {
    /// `[bs][face]`, slot 0 unused.
    m_star: Vec<Vec<Mat3>>,
    /// Frobenius norm of the source frame delta, `[bs][face]`.
    source_norms: Vec<Vec<Real>>,
}

/// Schedule values resolved for one iteration.
#[derive(Debug, Clone, Copy)]
struct IterationConsts {
    k: Real,
    theta: Real,
    beta: Real,
}

#[derive(Debug, Clone, Default)]
pub struct GradientSolver {
    options: GradientSolveOptions,
    state: Option<GradientState>,
}

impl GradientSolver {
    pub fn new(options: GradientSolveOptions) -> Self {
        Self {
            options,
            state: None,
        }
    }

    pub fn options(&self) -> &GradientSolveOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Precompute the expected deltas `M*` and the source frame norms.
    pub fn init(
        &mut self,
        source_gradients: &Gradients,
        target_gradients: &Gradients,
    ) -> Result<(), GradientSolveError> {
        let num_blendshapes = source_gradients.num_blendshapes();
        let num_faces = source_gradients.num_faces();
        if target_gradients.num_blendshapes() != num_blendshapes {
            return Err(GradientSolveError::Incompatible(format!(
                "source has {} blendshapes, target has {}",
                num_blendshapes,
                target_gradients.num_blendshapes()
            )));
        }
        if target_gradients.num_faces() != num_faces {
            return Err(GradientSolveError::Incompatible(format!(
                "source has {} faces, target has {}",
                num_faces,
                target_gradients.num_faces()
            )));
        }

        let mut m_star = vec![Vec::new()];
        let mut source_norms = vec![Vec::new()];
        for bs in 1..num_blendshapes {
            let stars = (0..num_faces)
                .map(|f| {
                    let s0 = source_gradients.neutral(f);
                    let si = source_gradients.blendshape(bs, f);
                    let t0 = target_gradients.neutral(f);
                    ((s0 + si) * source_gradients.neutral_inv(f)) * t0 - t0
                })
                .collect();
            let norms = (0..num_faces)
                .map(|f| source_gradients.blendshape(bs, f).norm())
                .collect();
            m_star.push(stars);
            source_norms.push(norms);
        }

        debug!(
            "gradient solver initialized: {} blendshapes, {} faces",
            num_blendshapes, num_faces
        );
        self.state = Some(GradientState {
            m_star,
            source_norms,
        });
        Ok(())
    }

    /// Estimate every non-neutral frame delta of the target for the active
    /// faces and write them into `target_gradients`.
    ///
    /// A face whose normal equations cannot be factored keeps its previous
    /// frames; all other faces are still solved and written, then the stage
    /// reports the failures.
    pub fn solve(
        &self,
        iteration: usize,
        target: &Rig,
        target_gradients: &mut Gradients,
    ) -> Result<(), GradientSolveError> {
        let state = self
            .state
            .as_ref()
            .ok_or(GradientSolveError::NotInitialized)?;
        if target.num_blendshapes() != state.m_star.len() {
            return Err(GradientSolveError::Incompatible(format!(
                "initialized for {} blendshapes, target has {}",
                state.m_star.len(),
                target.num_blendshapes()
            )));
        }
        target
            .validate()
            .map_err(|e| GradientSolveError::Incompatible(e.to_string()))?;
        if target_gradients.num_poses() != target.num_poses() {
            return Err(GradientSolveError::Incompatible(format!(
                "gradients cover {} poses, target has {}",
                target_gradients.num_poses(),
                target.num_poses()
            )));
        }

        let consts = IterationConsts {
            k: self.options.k.at(iteration),
            theta: self.options.theta.at(iteration),
            beta: self.options.beta.at(iteration),
        };
        info!(
            "gradient solver [{}]: k = {}, theta = {}, beta = {}",
            iteration, consts.k, consts.theta, consts.beta
        );

        if target.num_blendshapes() < 2 {
            return Ok(());
        }

        let faces: Vec<usize> = (0..target.num_active_faces())
            .map(|i| target.face(i))
            .collect();
        let gradients: &Gradients = target_gradients;
        let solve_segment = |worker: usize, segment: &[usize]| {
            if let (Some(first), Some(last)) = (segment.first(), segment.last()) {
                debug!(
                    "gradient worker {}: faces {}..={} ({})",
                    worker,
                    first,
                    last,
                    segment.len()
                );
            }
            segment
                .iter()
                .map(|&face| (face, self.solve_face(state, consts, face, target, gradients)))
                .collect::<Vec<_>>()
        };

        let results: Vec<(usize, Result<Vec<Mat3>, GradientSolveError>)> =
            if self.options.multithreaded && faces.len() > 1 {
                let segment = segment_len(faces.len(), rayon::current_num_threads());
                faces
                    .par_chunks(segment)
                    .enumerate()
                    .flat_map_iter(|(worker, chunk)| solve_segment(worker, chunk))
                    .collect()
            } else {
                solve_segment(0, &faces)
            };

        let total = results.len();
        let mut failures = Vec::new();
        for (face, result) in results {
            match result {
                Ok(frames) => {
                    for (bs, m) in frames.into_iter().enumerate() {
                        target_gradients.set_blendshape(bs + 1, face, m);
                    }
                }
                Err(e) => {
                    error!("gradient solver [{}]: {}", iteration, e);
                    failures.push(e);
                }
            }
        }

        match failures.len() {
            0 => Ok(()),
            failed => Err(GradientSolveError::Partial {
                failed,
                total,
                first: Box::new(failures.swap_remove(0)),
            }),
        }
    }

    /// Solve the normal equations of one face and return the frame deltas of
    /// blendshapes `1..N`.
    fn solve_face(
        &self,
        state: &GradientState,
        consts: IterationConsts,
        face: usize,
        target: &Rig,
        target_gradients: &Gradients,
    ) -> Result<Vec<Mat3>, GradientSolveError> {
        let (a, c) = assemble_face(state, consts, face, target, target_gradients);
        let at = a.transpose_view().to_csc();
        let ata = (&at * &a).to_csc();

        let unknowns = a.cols();
        let mut normal = DMat::zeros(unknowns, unknowns);
        for (&v, (r, col)) in ata.iter() {
            normal[(r, col)] += v;
        }
        let mut rhs = DVec::zeros(unknowns);
        for (&v, (r, col)) in a.iter() {
            rhs[col] += v * c[r];
        }

        let cholesky = normal
            .cholesky()
            .ok_or(GradientSolveError::Factorization { face })?;
        let x = cholesky.solve(&rhs);

        Ok(x.as_slice()
            .chunks_exact(FRAME_SIZE)
            .map(unflatten_frame)
            .collect())
    }
}

/// Sparse design matrix and right-hand side of one face.
fn assemble_face(
    state: &GradientState,
    consts: IterationConsts,
    face: usize,
    target: &Rig,
    target_gradients: &Gradients,
) -> (CsMat<Real>, Vec<Real>) {
    let num_poses = target.num_poses();
    let num_unknown = target.num_blendshapes() - 1;
    let fit_rows = num_poses * FRAME_SIZE;
    let rows = fit_rows + num_poses * num_unknown * FRAME_SIZE;
    let cols = num_unknown * FRAME_SIZE;

    let mut a = TriMat::new((rows, cols));
    let mut c = vec![0.0; rows];

    let neutral = target_gradients.neutral(face);
    for pose in 0..num_poses {
        let row = pose * FRAME_SIZE;
        for bs in 1..=num_unknown {
            let weight = target.weight(pose, bs);
            if weight == 0.0 {
                continue;
            }
            let col = (bs - 1) * FRAME_SIZE;
            for i in 0..FRAME_SIZE {
                a.add_triplet(row + i, col + i, weight);
            }
        }
        let observed = flatten_frame(&(target_gradients.pose(pose, face) - neutral));
        c[row..row + FRAME_SIZE].copy_from_slice(&observed);
    }

    for pose in 0..num_poses {
        for bs in 1..=num_unknown {
            let norm = state.source_norms[bs][face];
            let omega = ((1.0 + norm) / (consts.k + norm)).powf(consts.theta);
            let w_beta = omega * consts.beta;
            if w_beta == 0.0 {
                continue;
            }
            let row = fit_rows + (pose * num_unknown + (bs - 1)) * FRAME_SIZE;
            let col = (bs - 1) * FRAME_SIZE;
            let star = flatten_frame(&state.m_star[bs][face]);
            for i in 0..FRAME_SIZE {
                a.add_triplet(row + i, col + i, w_beta);
                c[row + i] = w_beta * star[i];
            }
        }
    }

    (a.to_csc(), c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blendrig_core::synthetic::{add_blended_poses, bump_rig, mirrored_target};

    #[test]
    fn default_beta_decays() {
        let opts = GradientSolveOptions::default();
        assert_eq!(opts.beta.at(0), 0.5);
        assert!((opts.beta.at(10) - 0.1).abs() < 1e-12);
        assert_eq!(opts.k.at(3), 0.1);
        assert_eq!(opts.theta.at(3), 2.0);
    }

    #[test]
    fn solve_requires_init() {
        let mut rig = bump_rig(3, 3, &[1.0]);
        add_blended_poses(&mut rig, &[vec![1.0, 1.0]]).unwrap();
        let mut g = Gradients::target(&rig);
        let solver = GradientSolver::default();
        assert_eq!(
            solver.solve(0, &rig, &mut g),
            Err(GradientSolveError::NotInitialized)
        );
    }

    #[test]
    fn unregularized_fit_recovers_source_deltas() {
        let mut source = bump_rig(4, 4, &[1.0, 0.6]);
        add_blended_poses(
            &mut source,
            &[vec![1.0, 1.0, 0.0], vec![1.0, 0.0, 1.0], vec![1.0, 0.5, 0.5]],
        )
        .unwrap();
        let target = mirrored_target(&source).unwrap();
        let source_g = Gradients::source(&source);
        let mut target_g = Gradients::target(&target);

        let mut solver = GradientSolver::new(GradientSolveOptions {
            multithreaded: false,
            ..GradientSolveOptions::unregularized()
        });
        solver.init(&source_g, &target_g).unwrap();
        solver.solve(0, &target, &mut target_g).unwrap();

        // Edge columns blend linearly, so all three poses agree on them.
        for bs in 1..3 {
            for f in 0..target_g.num_faces() {
                let diff = target_g.blendshape(bs, f) - source_g.blendshape(bs, f);
                let err = diff.columns(0, 2).norm();
                assert!(err < 1e-9, "bs {bs} face {f}: error {err}");
            }
        }
    }

    #[test]
    fn regularization_pulls_towards_expected_delta() {
        // One pose mixing both blendshapes cannot separate them; the
        // regularizer supplies the missing information.
        let mut source = bump_rig(4, 4, &[1.0, 0.6]);
        add_blended_poses(&mut source, &[vec![1.0, 1.0, 1.0]]).unwrap();
        let target = mirrored_target(&source).unwrap();
        let source_g = Gradients::source(&source);
        let mut target_g = Gradients::target(&target);

        let mut solver = GradientSolver::new(GradientSolveOptions {
            beta: Schedule::constant(1e3),
            ..GradientSolveOptions::default()
        });
        solver.init(&source_g, &target_g).unwrap();
        solver.solve(0, &target, &mut target_g).unwrap();

        // identical neutrals: M* equals the source delta
        for f in 0..target_g.num_faces() {
            for bs in 1..3 {
                let err = (target_g.blendshape(bs, f) - source_g.blendshape(bs, f)).norm();
                assert!(err < 1e-3, "bs {bs} face {f}: error {err}");
            }
        }
    }

    #[test]
    fn underdetermined_faces_are_reported() {
        // Blendshape 2 never appears in a pose and beta is zero.
        let mut source = bump_rig(3, 3, &[1.0, 0.5]);
        add_blended_poses(&mut source, &[vec![1.0, 1.0, 0.0]]).unwrap();
        let target = mirrored_target(&source).unwrap();
        let source_g = Gradients::source(&source);
        let mut target_g = Gradients::target(&target);

        let mut solver = GradientSolver::new(GradientSolveOptions::unregularized());
        solver.init(&source_g, &target_g).unwrap();
        let err = solver.solve(0, &target, &mut target_g).unwrap_err();
        match err {
            GradientSolveError::Partial { failed, total, .. } => {
                assert_eq!(failed, total);
                assert_eq!(total, target.num_faces());
            }
            other => panic!("unexpected error: {other}"),
        }
        // failed faces keep their previous (zero) frames
        assert_eq!(*target_g.blendshape(1, 0), Mat3::zeros());
    }

    #[test]
    fn only_active_faces_are_written() {
        let mut source = bump_rig(4, 4, &[1.0]);
        add_blended_poses(&mut source, &[vec![1.0, 1.0]]).unwrap();
        let mut target = mirrored_target(&source).unwrap();
        target.set_vertex_mask(&[0]).unwrap();
        let active: Vec<usize> = target.region().unwrap().faces().to_vec();

        let source_g = Gradients::source(&source);
        let mut target_g = Gradients::target(&target);
        let mut solver = GradientSolver::new(GradientSolveOptions::unregularized());
        solver.init(&source_g, &target_g).unwrap();
        solver.solve(0, &target, &mut target_g).unwrap();

        for f in 0..target_g.num_faces() {
            if !active.contains(&f) {
                assert_eq!(*target_g.blendshape(1, f), Mat3::zeros(), "face {f}");
            }
        }
    }
}
