//! Per-face deformation gradients of a rig.
//!
//! A frame is the 3x3 matrix `[e0 e1 n]` built from the two edges leaving the
//! first corner of a triangle and its unit normal. Arrays are indexed
//! `[blendshape][face]` and `[pose][face]` over the full mesh.
//!
//! Storage convention:
//! - `blendshape(0, f)` is the absolute neutral frame;
//! - `blendshape(bs, f)` for `bs >= 1` is the delta `frame(bs) - frame(neutral)`;
//! - `pose(p, f)` is the absolute frame of pose `p`.
//!
//! Target rigs start with all-zero deltas (unknown), filled in by the
//! gradient solver.

use log::debug;

use crate::{Mat3, Mesh, Pt3, Real, Rig};

/// Normals shorter than this are treated as degenerate.
const DEGENERATE_NORMAL: Real = 1e-12;

/// Local affine frame `[v1 - v0, v2 - v0, n]` of a triangle.
///
/// The normal is the normalized cross product of the two edges, or zero when
/// the edges are parallel.
pub fn triangle_frame(points: &[Pt3; 3]) -> Mat3 {
    let e0 = points[1] - points[0];
    let e1 = points[2] - points[0];
    let cross = e0.cross(&e1);
    let norm = cross.norm();
    let n = if norm > DEGENERATE_NORMAL {
        cross / norm
    } else {
        cross * 0.0
    };
    Mat3::from_columns(&[e0, e1, n])
}

/// Frames of every face of `mesh`.
pub fn mesh_frames(mesh: &Mesh) -> Vec<Mat3> {
    (0..mesh.num_faces())
        .map(|f| triangle_frame(&mesh.face_points(f)))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    blendshape_m: Vec<Vec<Mat3>>,
    pose_m: Vec<Vec<Mat3>>,
    neutral_inv: Vec<Mat3>,
}

impl Gradients {
    /// Gradients of a fully specified rig: every blendshape frame is derived
    /// from its geometry.
    pub fn source(rig: &Rig) -> Self {
        let mut g = Self::with_neutral(rig);
        for bs in 1..rig.num_blendshapes() {
            let frames = delta_frames(rig.blendshape(bs).mesh(), &g.blendshape_m[0]);
            g.blendshape_m.push(frames);
        }
        debug!(
            "source gradients: {} blendshapes, {} poses, {} faces",
            g.num_blendshapes(),
            g.num_poses(),
            g.num_faces()
        );
        g
    }

    /// Gradients of a rig with unknown blendshapes: non-neutral slots start at
    /// zero.
    pub fn target(rig: &Rig) -> Self {
        let mut g = Self::with_neutral(rig);
        let num_faces = g.num_faces();
        for _ in 1..rig.num_blendshapes() {
            g.blendshape_m.push(vec![Mat3::zeros(); num_faces]);
        }
        debug!(
            "target gradients: {} blendshapes, {} poses, {} faces",
            g.num_blendshapes(),
            g.num_poses(),
            g.num_faces()
        );
        g
    }

    fn with_neutral(rig: &Rig) -> Self {
        let neutral = mesh_frames(rig.neutral());
        let neutral_inv = neutral
            .iter()
            .map(|m| m.try_inverse().unwrap_or_else(Mat3::zeros))
            .collect();
        let pose_m = rig.poses().iter().map(|p| mesh_frames(p.mesh())).collect();
        Self {
            blendshape_m: vec![neutral],
            pose_m,
            neutral_inv,
        }
    }

    pub fn num_blendshapes(&self) -> usize {
        self.blendshape_m.len()
    }

    pub fn num_poses(&self) -> usize {
        self.pose_m.len()
    }

    pub fn num_faces(&self) -> usize {
        self.neutral_inv.len()
    }

    /// Neutral frame (`bs == 0`) or frame delta (`bs >= 1`).
    pub fn blendshape(&self, bs: usize, face: usize) -> &Mat3 {
        &self.blendshape_m[bs][face]
    }

    pub fn neutral(&self, face: usize) -> &Mat3 {
        &self.blendshape_m[0][face]
    }

    pub fn neutral_inv(&self, face: usize) -> &Mat3 {
        &self.neutral_inv[face]
    }

    pub fn pose(&self, pose: usize, face: usize) -> &Mat3 {
        &self.pose_m[pose][face]
    }

    /// Overwrite a non-neutral frame delta. The neutral slot is read-only.
    pub fn set_blendshape(&mut self, bs: usize, face: usize, m: Mat3) {
        if bs == 0 {
            return;
        }
        self.blendshape_m[bs][face] = m;
    }

    /// Recompute the delta frames of blendshape `bs` from its current mesh.
    pub fn refresh_blendshape(&mut self, rig: &Rig, bs: usize) {
        if bs == 0 {
            return;
        }
        self.blendshape_m[bs] = delta_frames(rig.blendshape(bs).mesh(), &self.blendshape_m[0]);
    }

    /// Affine map `(M0 + M_bs) * M0^-1` taking the neutral triangle to the
    /// blendshape triangle.
    ///
    /// Identity for the neutral and for unestimated (all-zero) slots.
    pub fn affine_map(&self, bs: usize, face: usize) -> Mat3 {
        let delta = &self.blendshape_m[bs][face];
        if bs == 0 || delta.iter().all(|&x| x == 0.0) {
            return Mat3::identity();
        }
        (self.blendshape_m[0][face] + delta) * self.neutral_inv[face]
    }
}

fn delta_frames(mesh: &Mesh, neutral: &[Mat3]) -> Vec<Mat3> {
    mesh_frames(mesh)
        .into_iter()
        .zip(neutral.iter())
        .map(|(m, m0)| m - m0)
        .collect()
}
