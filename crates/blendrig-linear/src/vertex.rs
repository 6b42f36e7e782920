//! Vertex reconstruction from per-face deformation gradients.
//!
//! For one target blendshape the unknowns are the vertex coordinates
//! (`column = vertex * 3 + coord`), optionally followed by one phantom vertex
//! per active face. Each active face contributes 9 rows expressing the edge
//! matrix `[x1 - x0, x2 - x0 (, x3 - x0)] · M0⁻¹` in terms of the vertex
//! coordinates, with the affine map `Q` of the face as right-hand side.
//! Without a phantom vertex `Q` is restricted to the triangle plane,
//! `Q · [e0 e1] · M0⁻¹[0..2, :]`, so that a consistent gradient field is
//! reproduced exactly.
//!
//! Anchors:
//! - fixed vertices of the matching source blendshape pull toward the neutral
//!   with `fixed_weight` (3 rows each);
//! - a small `rest_regularization` term on every column keeps the normal
//!   matrix positive definite (free translation, untouched vertices).
//!
//! The system matrix depends only on topology, the active faces and the fixed
//! set, so the sparse factorization of `AᵀA` is cached per blendshape together
//! with its layout. A solve whose layout differs refactors; otherwise only the
//! right-hand side is rebuilt.

use std::fmt;

use blendrig_core::{Gradients, Pt3, Real, Rig, Vec3};
use log::{debug, error, info};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::{Ldl, LdlNumeric};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VertexSolveError {
    #[error("vertex solver is not initialized")]
    NotInitialized,
    #[error("source and target rigs are incompatible: {0}")]
    Incompatible(String),
    #[error("invalid vertex solver options: {0}")]
    InvalidOptions(String),
    #[error("blendshape {blendshape} is out of range ({num_blendshapes} blendshapes)")]
    BlendshapeOutOfRange {
        blendshape: usize,
        num_blendshapes: usize,
    },
    #[error("blendshape {blendshape}: factorization failed: {reason}")]
    Factorization { blendshape: usize, reason: String },
    #[error("{failed} of {total} blendshapes failed, first: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: Box<VertexSolveError>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexSolveOptions {
    /// Weight of the fixed-vertex anchor rows; `0` disables them.
    pub fixed_weight: Real,
    /// Cap on the number of fixed vertices per blendshape (`None` = all).
    pub max_fixed: Option<usize>,
    /// Subsample the fixed set randomly instead of keeping the first ones.
    pub random_fixed: bool,
    /// Seed for the fixed-set subsampling.
    pub seed: u64,
    /// Add a fourth, out-of-plane vertex per face.
    pub use_phantom: bool,
    /// Damping pulling every unknown toward its rest position.
    pub rest_regularization: Real,
}

impl Default for VertexSolveOptions {
    fn default() -> Self {
        Self {
            fixed_weight: 0.5,
            max_fixed: Some(100),
            random_fixed: true,
            seed: 0,
            use_phantom: false,
            rest_regularization: 1e-8,
        }
    }
}

impl VertexSolveOptions {
    fn validate(&self) -> Result<(), VertexSolveError> {
        if !(self.fixed_weight >= 0.0 && self.fixed_weight.is_finite()) {
            return Err(VertexSolveError::InvalidOptions(format!(
                "fixed_weight must be a finite non-negative number, got {}",
                self.fixed_weight
            )));
        }
        if !(self.rest_regularization >= 0.0 && self.rest_regularization.is_finite()) {
            return Err(VertexSolveError::InvalidOptions(format!(
                "rest_regularization must be a finite non-negative number, got {}",
                self.rest_regularization
            )));
        }
        Ok(())
    }
}

/// Cached normal-equations factorization of one blendshape.
struct Factor {
    layout: Layout,
    at: CsMat<Real>,
    ldl: LdlNumeric<Real, usize>,
    rhs: Vec<Real>,
    x: Vec<Real>,
}

enum FactorSlot {
    Uninitialized,
    Ready(Box<Factor>),
}

impl fmt::Debug for FactorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "FactorSlot::Uninitialized"),
            Self::Ready(factor) => write!(
                f,
                "FactorSlot::Ready({} x {})",
                factor.at.cols(),
                factor.at.rows()
            ),
        }
    }
}

/// Row/column layout of one system.
#[derive(Debug, Clone, PartialEq)]
struct Layout {
    num_vertices: usize,
    faces: Vec<usize>,
    phantom: bool,
    fixed_start: usize,
    rest_start: usize,
    rows: usize,
    cols: usize,
}

impl Layout {
    fn new(target: &Rig, num_fixed: usize, options: &VertexSolveOptions) -> Self {
        let num_vertices = target.num_vertices();
        let faces: Vec<usize> = (0..target.num_active_faces())
            .map(|i| target.face(i))
            .collect();
        let phantom = options.use_phantom;
        let cols = 3 * (num_vertices + if phantom { faces.len() } else { 0 });
        let fixed_start = 9 * faces.len();
        let fixed_rows = if options.fixed_weight > 0.0 {
            3 * num_fixed
        } else {
            0
        };
        let rest_start = fixed_start + fixed_rows;
        let rest_rows = if options.rest_regularization > 0.0 {
            cols
        } else {
            0
        };
        Self {
            num_vertices,
            faces,
            phantom,
            fixed_start,
            rest_start,
            rows: rest_start + rest_rows,
            cols,
        }
    }

    fn phantom_column(&self, compact_face: usize) -> usize {
        3 * (self.num_vertices + compact_face)
    }

    /// First column of each corner of a face (3 or 4 entries).
    fn corner_columns(&self, compact_face: usize, tri: [usize; 3]) -> ([usize; 4], usize) {
        let cols = [
            3 * tri[0],
            3 * tri[1],
            3 * tri[2],
            self.phantom_column(compact_face),
        ];
        (cols, if self.phantom { 4 } else { 3 })
    }
}

#[derive(Debug, Default)]
pub struct VertexSolver {
    options: VertexSolveOptions,
    /// Selected fixed vertices per blendshape, slot 0 unused.
    fixed: Vec<Vec<usize>>,
    slots: Vec<FactorSlot>,
    initialized: bool,
}

impl VertexSolver {
    pub fn new(options: VertexSolveOptions) -> Self {
        Self {
            options,
            fixed: Vec::new(),
            slots: Vec::new(),
            initialized: false,
        }
    }

    pub fn options(&self) -> &VertexSolveOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Select the anchor vertices of every blendshape from the source rig and
    /// reset all cached factorizations.
    pub fn init(&mut self, source: &Rig, target: &Rig) -> Result<(), VertexSolveError> {
        self.options.validate()?;
        if source.num_blendshapes() != target.num_blendshapes() {
            return Err(VertexSolveError::Incompatible(format!(
                "source has {} blendshapes, target has {}",
                source.num_blendshapes(),
                target.num_blendshapes()
            )));
        }
        if !source.neutral().same_topology(target.neutral()) {
            return Err(VertexSolveError::Incompatible(
                "neutral meshes differ in topology".to_string(),
            ));
        }

        self.fixed = (0..source.num_blendshapes())
            .map(|bs| {
                if bs == 0 {
                    Vec::new()
                } else {
                    self.select_fixed(source.blendshape(bs).fixed())
                }
            })
            .collect();
        self.slots = (0..target.num_blendshapes())
            .map(|_| FactorSlot::Uninitialized)
            .collect();
        self.initialized = true;

        debug!(
            "vertex solver initialized: fixed vertices per blendshape {:?}",
            self.fixed.iter().skip(1).map(Vec::len).collect::<Vec<_>>()
        );
        Ok(())
    }

    fn select_fixed(&self, fixed: &[usize]) -> Vec<usize> {
        let mut selected = fixed.to_vec();
        if let Some(max) = self.options.max_fixed {
            if max < selected.len() {
                if self.options.random_fixed {
                    let mut rng = StdRng::seed_from_u64(self.options.seed);
                    selected.shuffle(&mut rng);
                    selected.truncate(max);
                    selected.sort_unstable();
                } else {
                    selected.truncate(max);
                }
            }
        }
        selected
    }

    /// Anchor vertices used for blendshape `bs`.
    pub fn fixed_vertices(&self, bs: usize) -> &[usize] {
        self.fixed.get(bs).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace the anchor set of a blendshape and drop its factorization.
    pub fn set_fixed_vertices(
        &mut self,
        bs: usize,
        mut vertices: Vec<usize>,
    ) -> Result<(), VertexSolveError> {
        self.check_blendshape(bs)?;
        vertices.sort_unstable();
        vertices.dedup();
        self.fixed[bs] = vertices;
        self.invalidate(bs);
        Ok(())
    }

    /// Drop the cached factorization of one blendshape.
    pub fn invalidate(&mut self, bs: usize) {
        if let Some(slot) = self.slots.get_mut(bs) {
            *slot = FactorSlot::Uninitialized;
        }
    }

    /// Drop every cached factorization.
    pub fn invalidate_all(&mut self) {
        for slot in &mut self.slots {
            *slot = FactorSlot::Uninitialized;
        }
    }

    pub fn is_factored(&self, bs: usize) -> bool {
        matches!(self.slots.get(bs), Some(FactorSlot::Ready(_)))
    }

    /// Unknown vector of the last successful solve of `bs`.
    pub fn last_solution(&self, bs: usize) -> Option<&[Real]> {
        match self.slots.get(bs) {
            Some(FactorSlot::Ready(factor)) if !factor.x.is_empty() => Some(&factor.x),
            _ => None,
        }
    }

    fn check_blendshape(&self, bs: usize) -> Result<(), VertexSolveError> {
        if !self.initialized {
            return Err(VertexSolveError::NotInitialized);
        }
        if bs == 0 || bs >= self.slots.len() {
            return Err(VertexSolveError::BlendshapeOutOfRange {
                blendshape: bs,
                num_blendshapes: self.slots.len(),
            });
        }
        Ok(())
    }

    /// Reconstruct one blendshape (`Some(bs)`) or every non-neutral one.
    ///
    /// Blendshapes whose factorization fails are left untouched while the
    /// others are still reconstructed; the failures are then reported.
    pub fn solve(
        &mut self,
        iteration: usize,
        blendshape: Option<usize>,
        target: &mut Rig,
        target_gradients: &Gradients,
    ) -> Result<(), VertexSolveError> {
        if !self.initialized {
            return Err(VertexSolveError::NotInitialized);
        }
        if target.num_blendshapes() != self.slots.len() {
            return Err(VertexSolveError::Incompatible(format!(
                "initialized for {} blendshapes, target has {}",
                self.slots.len(),
                target.num_blendshapes()
            )));
        }
        if target_gradients.num_faces() != target.num_faces()
            || target_gradients.num_blendshapes() != target.num_blendshapes()
        {
            return Err(VertexSolveError::Incompatible(
                "gradients do not match the target rig".to_string(),
            ));
        }

        info!("vertex solver [{}]", iteration);
        let blendshapes: Vec<usize> = match blendshape {
            Some(bs) => {
                self.check_blendshape(bs)?;
                vec![bs]
            }
            None => (1..target.num_blendshapes()).collect(),
        };

        let total = blendshapes.len();
        let mut failures = Vec::new();
        for bs in blendshapes {
            if let Err(e) = self.transfer(bs, target, target_gradients) {
                error!("vertex solver [{}]: {}", iteration, e);
                failures.push(e);
            }
        }

        match failures.len() {
            0 => Ok(()),
            failed => Err(VertexSolveError::Partial {
                failed,
                total,
                first: Box::new(failures.swap_remove(0)),
            }),
        }
    }

    /// Factor (if needed) and solve the system of one blendshape, then write
    /// the positions into its mesh.
    pub fn transfer(
        &mut self,
        bs: usize,
        target: &mut Rig,
        target_gradients: &Gradients,
    ) -> Result<(), VertexSolveError> {
        self.check_blendshape(bs)?;
        let layout = Layout::new(target, self.fixed[bs].len(), &self.options);

        // Same-sized regions still change which faces own the rows.
        let stale = match &self.slots[bs] {
            FactorSlot::Uninitialized => true,
            FactorSlot::Ready(factor) if factor.layout != layout => {
                debug!("vertex solver: blendshape {} layout changed, refactoring", bs);
                true
            }
            FactorSlot::Ready(_) => false,
        };
        if stale {
            let factor = self.factor(bs, &layout, target, target_gradients)?;
            self.slots[bs] = FactorSlot::Ready(Box::new(factor));
        }

        let rhs = self.assemble_rhs(bs, &layout, target, target_gradients);
        let FactorSlot::Ready(factor) = &mut self.slots[bs] else {
            return Err(VertexSolveError::NotInitialized);
        };
        let mut atc = vec![0.0; layout.cols];
        for (&v, (r, c)) in factor.at.iter() {
            atc[r] += v * rhs[c];
        }
        let x = factor.ldl.solve(&atc[..]);
        if let Some(i) = x.iter().position(|v| !v.is_finite()) {
            return Err(VertexSolveError::Factorization {
                blendshape: bs,
                reason: format!("non-finite solution at unknown {i}"),
            });
        }

        let mesh = target.blendshape_mut(bs).mesh_mut();
        for (v, p) in mesh.positions_mut().iter_mut().enumerate() {
            *p = Pt3::new(x[3 * v], x[3 * v + 1], x[3 * v + 2]);
        }
        factor.rhs = rhs;
        factor.x = x;
        debug!("vertex solver: blendshape {} reconstructed", bs);
        Ok(())
    }

    fn factor(
        &self,
        bs: usize,
        layout: &Layout,
        target: &Rig,
        target_gradients: &Gradients,
    ) -> Result<Factor, VertexSolveError> {
        let a = self.assemble_matrix(bs, layout, target, target_gradients);
        let at = a.transpose_view().to_csc();
        let ata = (&at * &a).to_csc();
        debug!(
            "vertex solver: factoring blendshape {} ({} x {}, {} non-zeros)",
            bs,
            layout.rows,
            layout.cols,
            ata.nnz()
        );

        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(ata.view())
            .map_err(|e| VertexSolveError::Factorization {
                blendshape: bs,
                reason: e.to_string(),
            })?;
        if let Some((i, d)) = ldl.d().iter().enumerate().find(|(_, d)| **d <= 0.0) {
            return Err(VertexSolveError::Factorization {
                blendshape: bs,
                reason: format!("pivot {i} is {d}, normal matrix is not positive definite"),
            });
        }

        Ok(Factor {
            layout: layout.clone(),
            at,
            ldl,
            rhs: Vec::new(),
            x: Vec::new(),
        })
    }

    fn assemble_matrix(
        &self,
        bs: usize,
        layout: &Layout,
        target: &Rig,
        target_gradients: &Gradients,
    ) -> CsMat<Real> {
        let mut a = TriMat::new((layout.rows, layout.cols));
        let neutral = target.neutral();

        for (k, &face) in layout.faces.iter().enumerate() {
            let inv = target_gradients.neutral_inv(face);
            let (corners, num_corners) = layout.corner_columns(k, neutral.triangle(face));
            for coord in 0..3 {
                for eqn in 0..3 {
                    let row = 9 * k + 3 * coord + eqn;
                    let mut first = -(inv[(0, eqn)] + inv[(1, eqn)]);
                    if layout.phantom {
                        first -= inv[(2, eqn)];
                    }
                    let coefficients = [first, inv[(0, eqn)], inv[(1, eqn)], inv[(2, eqn)]];
                    for corner in 0..num_corners {
                        a.add_triplet(row, corners[corner] + coord, coefficients[corner]);
                    }
                }
            }
        }

        if self.options.fixed_weight > 0.0 {
            for (i, &v) in self.fixed[bs].iter().enumerate() {
                for coord in 0..3 {
                    a.add_triplet(
                        layout.fixed_start + 3 * i + coord,
                        3 * v + coord,
                        self.options.fixed_weight,
                    );
                }
            }
        }

        if self.options.rest_regularization > 0.0 {
            let damping = self.options.rest_regularization.sqrt();
            for col in 0..layout.cols {
                a.add_triplet(layout.rest_start + col, col, damping);
            }
        }

        a.to_csc()
    }

    fn assemble_rhs(
        &self,
        bs: usize,
        layout: &Layout,
        target: &Rig,
        target_gradients: &Gradients,
    ) -> Vec<Real> {
        let mut c = vec![0.0; layout.rows];
        let neutral = target.neutral();

        for (k, &face) in layout.faces.iter().enumerate() {
            let q = target_gradients.affine_map(bs, face);
            let q = if layout.phantom {
                q
            } else {
                let m0 = target_gradients.neutral(face);
                let inv = target_gradients.neutral_inv(face);
                q * (m0.fixed_columns::<2>(0) * inv.fixed_rows::<2>(0))
            };
            for coord in 0..3 {
                for eqn in 0..3 {
                    c[9 * k + 3 * coord + eqn] = q[(coord, eqn)];
                }
            }
        }

        if self.options.fixed_weight > 0.0 {
            let w = self.options.fixed_weight;
            for (i, &v) in self.fixed[bs].iter().enumerate() {
                let p = neutral.position(v);
                for coord in 0..3 {
                    c[layout.fixed_start + 3 * i + coord] = w * p[coord];
                }
            }
        }

        if self.options.rest_regularization > 0.0 {
            let damping = self.options.rest_regularization.sqrt();
            for (v, p) in neutral.positions().iter().enumerate() {
                for coord in 0..3 {
                    c[layout.rest_start + 3 * v + coord] = damping * p[coord];
                }
            }
            if layout.phantom {
                for (k, &face) in layout.faces.iter().enumerate() {
                    let n: Vec3 = target_gradients.neutral(face).column(2).into_owned();
                    let rest = neutral.position(neutral.triangle(face)[0]) + n;
                    let col = layout.phantom_column(k);
                    for coord in 0..3 {
                        c[layout.rest_start + col + coord] = damping * rest[coord];
                    }
                }
            }
        }

        c
    }
}
