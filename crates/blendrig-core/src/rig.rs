//! Rig data model: neutral, blendshapes, example poses and the active region.
//!
//! `blendshapes[0]` is always the neutral mesh. Pose weight vectors have one
//! entry per blendshape, and entry 0 (the neutral contribution) is always 1.
//!
//! The optional [`ActiveRegion`] restricts solving to a subset of the mesh.
//! Index translation between compact ("active") and full indices is the
//! identity when no region is set.

use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{is_near_zero, Mesh, MeshError, Real};

/// Per-pose blend weights, `weights[0]` is the neutral contribution.
pub type Weights = Vec<Real>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RigError {
    #[error("{what} does not share the neutral mesh topology")]
    TopologyMismatch { what: String },
    #[error("vertex {vertex} is out of range (mesh has {num_vertices} vertices)")]
    VertexOutOfRange { vertex: usize, num_vertices: usize },
    #[error("pose {pose} has {got} weights, expected {expected}")]
    WeightCount {
        pose: usize,
        expected: usize,
        got: usize,
    },
    #[error("pose {pose} has neutral weight {value}, expected 1")]
    NeutralWeight { pose: usize, value: Real },
    #[error("rig has no poses")]
    NoPoses,
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

/// One additive rig component.
///
/// The fixed set lists vertices this blendshape leaves at their neutral
/// position. It is computed once when the mesh is assigned and is always
/// empty for the neutral and for placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blendshape {
    mesh: Mesh,
    fixed: Vec<usize>,
}

impl Blendshape {
    /// Blendshape without a fixed set (neutral or placeholder).
    pub fn unanchored(mesh: Mesh) -> Self {
        Self {
            mesh,
            fixed: Vec::new(),
        }
    }

    /// Blendshape whose fixed set holds every vertex displaced by less than
    /// `eps` (per coordinate) from `neutral`.
    pub fn new(mesh: Mesh, neutral: &Mesh, eps: Real) -> Self {
        let fixed = mesh
            .offsets_from(neutral)
            .iter()
            .enumerate()
            .filter(|(_, d)| is_near_zero(d, eps))
            .map(|(v, _)| v)
            .collect();
        Self { mesh, fixed }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Mutable mesh access. The fixed set is left untouched.
    pub fn mesh_mut(&mut self) -> &mut Mesh {
        &mut self.mesh
    }

    /// Fixed vertex indices, sorted ascending.
    pub fn fixed(&self) -> &[usize] {
        &self.fixed
    }

    pub fn num_fixed(&self) -> usize {
        self.fixed.len()
    }

    pub fn is_fixed(&self, vertex: usize) -> bool {
        self.fixed.binary_search(&vertex).is_ok()
    }
}

/// Example expression mesh with its (possibly estimated) weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    mesh: Mesh,
    weights: Weights,
}

impl Pose {
    pub fn new(mesh: Mesh, weights: Weights) -> Self {
        Self { mesh, weights }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn weights(&self) -> &[Real] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Weights {
        &mut self.weights
    }

    pub fn set_weights(&mut self, weights: Weights) {
        self.weights = weights;
    }
}

/// Sorted, deduplicated vertex and face subsets of the full mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRegion {
    vertices: Vec<usize>,
    faces: Vec<usize>,
}

impl ActiveRegion {
    pub fn new(mut vertices: Vec<usize>, mut faces: Vec<usize>) -> Self {
        vertices.sort_unstable();
        vertices.dedup();
        faces.sort_unstable();
        faces.dedup();
        Self { vertices, faces }
    }

    pub fn vertices(&self) -> &[usize] {
        &self.vertices
    }

    pub fn faces(&self) -> &[usize] {
        &self.faces
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.faces.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rig {
    blendshapes: Vec<Blendshape>,
    poses: Vec<Pose>,
    region: Option<ActiveRegion>,
}

impl Rig {
    /// New rig holding only the neutral mesh.
    pub fn new(neutral: Mesh) -> Self {
        Self {
            blendshapes: vec![Blendshape::unanchored(neutral)],
            poses: Vec::new(),
            region: None,
        }
    }

    pub fn neutral(&self) -> &Mesh {
        self.blendshapes[0].mesh()
    }

    /// Append a known blendshape and derive its fixed set with threshold `eps`.
    pub fn add_blendshape(&mut self, mesh: Mesh, eps: Real) -> Result<(), RigError> {
        self.check_topology(&mesh, || format!("blendshape {}", self.blendshapes.len()))?;
        let blendshape = Blendshape::new(mesh, self.neutral(), eps);
        self.blendshapes.push(blendshape);
        Ok(())
    }

    /// Append a blendshape whose topology is already known to match.
    pub(crate) fn push_blendshape(&mut self, mesh: Mesh, eps: Real) {
        let blendshape = Blendshape::new(mesh, self.neutral(), eps);
        self.blendshapes.push(blendshape);
    }

    /// Append an example pose. Weight vectors are checked by [`Rig::validate`].
    pub fn add_pose(&mut self, mesh: Mesh, weights: Weights) -> Result<(), RigError> {
        self.check_topology(&mesh, || format!("pose {}", self.poses.len()))?;
        self.poses.push(Pose::new(mesh, weights));
        Ok(())
    }

    /// Grow the blendshape list to `num` entries with neutral copies.
    ///
    /// Placeholders carry no fixed set; existing blendshapes are kept.
    pub fn generate_empty_blendshapes(&mut self, num: usize) {
        while self.blendshapes.len() < num {
            let placeholder = Blendshape::unanchored(self.neutral().clone());
            self.blendshapes.push(placeholder);
        }
    }

    fn check_topology(&self, mesh: &Mesh, what: impl FnOnce() -> String) -> Result<(), RigError> {
        if mesh.same_topology(self.neutral()) {
            Ok(())
        } else {
            Err(RigError::TopologyMismatch { what: what() })
        }
    }

    /// Check topology of every mesh and the shape of every weight vector.
    pub fn validate(&self) -> Result<(), RigError> {
        let neutral = self.neutral();
        for (bs, blendshape) in self.blendshapes.iter().enumerate().skip(1) {
            if !blendshape.mesh().same_topology(neutral) {
                return Err(RigError::TopologyMismatch {
                    what: format!("blendshape {bs}"),
                });
            }
        }
        let expected = self.num_blendshapes();
        for (pose, p) in self.poses.iter().enumerate() {
            if !p.mesh().same_topology(neutral) {
                return Err(RigError::TopologyMismatch {
                    what: format!("pose {pose}"),
                });
            }
            if p.weights().len() != expected {
                return Err(RigError::WeightCount {
                    pose,
                    expected,
                    got: p.weights().len(),
                });
            }
            if p.weights()[0] != 1.0 {
                return Err(RigError::NeutralWeight {
                    pose,
                    value: p.weights()[0],
                });
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Active region
    // ─────────────────────────────────────────────────────────────────────────

    pub fn region(&self) -> Option<&ActiveRegion> {
        self.region.as_ref()
    }

    pub fn set_region(&mut self, region: Option<ActiveRegion>) {
        self.region = region.filter(|r| !r.is_empty());
    }

    /// Restrict solving to the neighbourhood of `vertices`.
    ///
    /// The mask grows to every face touching a masked vertex, then to every
    /// vertex of those faces.
    pub fn set_vertex_mask(&mut self, vertices: &[usize]) -> Result<(), RigError> {
        let neutral = self.neutral();
        let num_vertices = neutral.num_vertices();
        if let Some(&vertex) = vertices.iter().find(|&&v| v >= num_vertices) {
            return Err(RigError::VertexOutOfRange {
                vertex,
                num_vertices,
            });
        }
        let faces = neutral.faces_around(vertices);
        let vertices = neutral.vertices_of(&faces);
        debug!(
            "vertex mask: {} / {} vertices, {} / {} faces",
            vertices.len(),
            num_vertices,
            faces.len(),
            neutral.num_faces()
        );
        self.set_region(Some(ActiveRegion::new(vertices, faces)));
        Ok(())
    }

    /// Detect the active region from the poses: every vertex displaced by at
    /// least `eps` (in any coordinate) from the neutral in some pose, plus the
    /// faces around those vertices.
    pub fn find_modified(&mut self, eps: Real) {
        let neutral = self.neutral();
        let mut moved = vec![false; neutral.num_vertices()];
        for pose in &self.poses {
            for (v, d) in pose.mesh().offsets_from(neutral).iter().enumerate() {
                if !is_near_zero(d, eps) {
                    moved[v] = true;
                }
            }
        }
        let vertices: Vec<usize> = moved
            .iter()
            .enumerate()
            .filter_map(|(v, &m)| m.then_some(v))
            .collect();
        let faces = neutral.faces_around(&vertices);
        debug!(
            "modified region: {} vertices, {} faces",
            vertices.len(),
            faces.len()
        );
        self.set_region(Some(ActiveRegion::new(vertices, faces)));
    }

    /// Number of vertices in the active region (all vertices if unmasked).
    pub fn num_active_vertices(&self) -> usize {
        match &self.region {
            Some(r) => r.vertices.len(),
            None => self.neutral().num_vertices(),
        }
    }

    /// Number of faces in the active region (all faces if unmasked).
    pub fn num_active_faces(&self) -> usize {
        match &self.region {
            Some(r) => r.faces.len(),
            None => self.neutral().num_faces(),
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.neutral().num_vertices()
    }

    pub fn num_faces(&self) -> usize {
        self.neutral().num_faces()
    }

    /// Compact vertex index → full mesh index.
    pub fn vertex(&self, index: usize) -> usize {
        match &self.region {
            Some(r) => r.vertices[index],
            None => index,
        }
    }

    /// Full mesh index → compact index, `None` outside the active region.
    pub fn vertex_index(&self, vertex: usize) -> Option<usize> {
        match &self.region {
            Some(r) => r.vertices.binary_search(&vertex).ok(),
            None => Some(vertex),
        }
    }

    /// Compact face index → full mesh index.
    pub fn face(&self, index: usize) -> usize {
        match &self.region {
            Some(r) => r.faces[index],
            None => index,
        }
    }

    /// Full face index → compact index, `None` outside the active region.
    pub fn face_index(&self, face: usize) -> Option<usize> {
        match &self.region {
            Some(r) => r.faces.binary_search(&face).ok(),
            None => Some(face),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Blendshapes and poses
    // ─────────────────────────────────────────────────────────────────────────

    pub fn blendshapes(&self) -> &[Blendshape] {
        &self.blendshapes
    }

    pub fn blendshape(&self, bs: usize) -> &Blendshape {
        &self.blendshapes[bs]
    }

    pub fn blendshape_mut(&mut self, bs: usize) -> &mut Blendshape {
        &mut self.blendshapes[bs]
    }

    pub fn num_blendshapes(&self) -> usize {
        self.blendshapes.len()
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn pose(&self, pose: usize) -> &Pose {
        &self.poses[pose]
    }

    pub fn pose_mut(&mut self, pose: usize) -> &mut Pose {
        &mut self.poses[pose]
    }

    pub fn num_poses(&self) -> usize {
        self.poses.len()
    }

    pub fn weights(&self, pose: usize) -> &[Real] {
        self.poses[pose].weights()
    }

    pub fn weights_mut(&mut self, pose: usize) -> &mut Weights {
        self.poses[pose].weights_mut()
    }

    pub fn weight(&self, pose: usize, bs: usize) -> Real {
        self.poses[pose].weights()[bs]
    }

    /// Snapshot of every pose's weight vector.
    pub fn all_weights(&self) -> Vec<Weights> {
        self.poses.iter().map(|p| p.weights().to_vec()).collect()
    }

    /// Number of strictly positive weights of a pose (neutral included).
    pub fn num_active_weights(&self, pose: usize) -> usize {
        self.weights(pose).iter().filter(|&&w| w > 0.0).count()
    }

    /// Blend the rig: `neutral + Σ_{i≥1} w_i (blendshape_i − neutral)`.
    pub fn generate_pose(&self, weights: &[Real]) -> Mesh {
        let neutral = self.neutral();
        let mut out = neutral.clone();
        for (bs, blendshape) in self.blendshapes.iter().enumerate().skip(1) {
            let w = weights.get(bs).copied().unwrap_or(0.0);
            if w == 0.0 {
                continue;
            }
            out.add_scaled_offsets(&blendshape.mesh().offsets_from(neutral), w);
        }
        out
    }

    /// Deterministically perturb every non-neutral weight:
    /// `clamp(w (1 − a) + |b|, 0, 1)` with `a ~ N(0, 0.5)` and `b ~ N(0, 0.1)`.
    pub fn randomize_weights(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for pose in &mut self.poses {
            for w in pose.weights_mut().iter_mut().skip(1) {
                let a = 0.5 * standard_normal(&mut rng);
                let b = 0.1 * standard_normal(&mut rng);
                *w = (*w * (1.0 - a) + b.abs()).clamp(0.0, 1.0);
            }
        }
    }
}

/// Box–Muller sample from `N(0, 1)`.
fn standard_normal(rng: &mut StdRng) -> Real {
    let u1: Real = rng.random::<Real>().max(Real::MIN_POSITIVE);
    let u2: Real = rng.random::<Real>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::grid_mesh;
    use crate::Pt3;

    fn lifted(mesh: &Mesh, vertices: &[usize], dz: Real) -> Mesh {
        let mut out = mesh.clone();
        for &v in vertices {
            let p = *out.position(v);
            out.set_position(v, Pt3::new(p.x, p.y, p.z + dz));
        }
        out
    }

    #[test]
    fn fixed_set_excludes_moved_vertices() {
        let neutral = grid_mesh(3, 3, 1.0);
        let mut rig = Rig::new(neutral.clone());
        rig.add_blendshape(lifted(&neutral, &[4], 1.0), 0.5).unwrap();
        let bs = rig.blendshape(1);
        assert_eq!(bs.num_fixed(), 8);
        assert!(!bs.is_fixed(4));
        assert!(bs.is_fixed(0));
        assert_eq!(rig.blendshape(0).num_fixed(), 0);
    }

    #[test]
    fn index_mapping_round_trips() {
        let neutral = grid_mesh(4, 4, 1.0);
        let mut rig = Rig::new(neutral.clone());
        for i in 0..rig.num_vertices() {
            assert_eq!(rig.vertex_index(rig.vertex(i)), Some(i));
        }

        rig.add_pose(lifted(&neutral, &[5], 1.0), vec![1.0]).unwrap();
        rig.find_modified(0.5);
        let region = rig.region().unwrap().clone();
        assert!(region.vertices().contains(&5));
        for i in 0..rig.num_active_vertices() {
            assert_eq!(rig.vertex_index(rig.vertex(i)), Some(i));
        }
        for i in 0..rig.num_active_faces() {
            assert_eq!(rig.face_index(rig.face(i)), Some(i));
        }
        assert_eq!(rig.vertex_index(15), None);
    }

    #[test]
    fn vertex_mask_expands_to_face_neighbourhood() {
        let neutral = grid_mesh(3, 3, 1.0);
        let mut rig = Rig::new(neutral);
        rig.set_vertex_mask(&[0]).unwrap();
        let region = rig.region().unwrap();
        assert!(!region.faces().is_empty());
        assert!(region.vertices().contains(&0));
        assert!(region.vertices().windows(2).all(|w| w[0] < w[1]));
        assert!(matches!(
            rig.set_vertex_mask(&[100]),
            Err(RigError::VertexOutOfRange { vertex: 100, .. })
        ));
    }

    #[test]
    fn validate_reports_bad_weights() {
        let neutral = grid_mesh(2, 2, 1.0);
        let mut rig = Rig::new(neutral.clone());
        rig.add_blendshape(lifted(&neutral, &[0], 1.0), 0.5).unwrap();
        rig.add_pose(neutral.clone(), vec![1.0]).unwrap();
        assert!(matches!(
            rig.validate(),
            Err(RigError::WeightCount { pose: 0, expected: 2, got: 1 })
        ));
        rig.pose_mut(0).set_weights(vec![0.5, 0.0]);
        assert!(matches!(rig.validate(), Err(RigError::NeutralWeight { .. })));
        rig.pose_mut(0).set_weights(vec![1.0, 0.0]);
        assert!(rig.validate().is_ok());
    }

    #[test]
    fn generate_pose_blends_offsets() {
        let neutral = grid_mesh(2, 2, 1.0);
        let mut rig = Rig::new(neutral.clone());
        rig.add_blendshape(lifted(&neutral, &[3], 2.0), 0.5).unwrap();
        let pose = rig.generate_pose(&[1.0, 0.25]);
        assert!((pose.position(3).z - 0.5).abs() < 1e-12);
        assert_eq!(pose.position(0), neutral.position(0));
    }

    #[test]
    fn randomized_weights_stay_in_unit_box() {
        let neutral = grid_mesh(2, 2, 1.0);
        let mut rig = Rig::new(neutral.clone());
        rig.generate_empty_blendshapes(4);
        for _ in 0..5 {
            rig.add_pose(neutral.clone(), vec![1.0, 0.9, 0.0, 0.4]).unwrap();
        }
        rig.randomize_weights(7);
        for pose in rig.poses() {
            assert_eq!(pose.weights()[0], 1.0);
            assert!(pose.weights().iter().all(|w| (0.0..=1.0).contains(w)));
        }
        let mut again = rig.clone();
        for pose in 0..again.num_poses() {
            again.pose_mut(pose).set_weights(vec![1.0, 0.9, 0.0, 0.4]);
        }
        again.randomize_weights(7);
        assert_eq!(again.all_weights(), rig.all_weights());
    }
}
