//! Deterministic synthetic rigs for tests and benchmarks.
//!
//! Meshes are regular grids in the `z = 0` plane; blendshapes are smooth bumps
//! with compact support, so every blendshape leaves the grid border exactly at
//! rest and has a non-empty fixed set.

mod noise;

pub use noise::UniformVertexNoise;

use crate::{Mesh, Pt3, Real, Rig, RigError, Vec3, Weights};

/// Fixed-vertex threshold used by the synthetic builders.
pub const FIXED_EPS: Real = 1e-9;

/// Regular `nx * ny` vertex grid with two counter-clockwise triangles per cell.
///
/// Vertex `(i, j)` has index `j * nx + i` and sits at `(i, j, 0) * spacing`.
pub fn grid_mesh(nx: usize, ny: usize, spacing: Real) -> Mesh {
    let mut positions = Vec::with_capacity(nx * ny);
    for j in 0..ny {
        for i in 0..nx {
            positions.push(Pt3::new(i as Real * spacing, j as Real * spacing, 0.0));
        }
    }

    let mut triangles = Vec::with_capacity(2 * nx.saturating_sub(1) * ny.saturating_sub(1));
    for j in 0..ny.saturating_sub(1) {
        for i in 0..nx.saturating_sub(1) {
            let v00 = j * nx + i;
            let v10 = v00 + 1;
            let v01 = v00 + nx;
            let v11 = v01 + 1;
            triangles.push([v00, v10, v11]);
            triangles.push([v00, v11, v01]);
        }
    }

    Mesh::from_raw(positions, triangles)
}

/// Smooth bump `amplitude * (1 - r²/R²)²` around `center`, zero for `r >= R`.
pub fn bump_offsets(mesh: &Mesh, center: Pt3, radius: Real, amplitude: Vec3) -> Vec<Vec3> {
    let r2 = radius * radius;
    mesh.positions()
        .iter()
        .map(|p| {
            let d2 = (p - center).norm_squared();
            if d2 >= r2 {
                Vec3::zeros()
            } else {
                let s = 1.0 - d2 / r2;
                amplitude * (s * s)
            }
        })
        .collect()
}

/// Copy of `base` displaced by `offsets`.
pub fn displaced(base: &Mesh, offsets: &[Vec3]) -> Mesh {
    let mut out = base.clone();
    out.add_scaled_offsets(offsets, 1.0);
    out
}

/// Grid rig with one bump blendshape per entry of `amplitudes`.
///
/// Bump centres are spread along the x axis; each bump also pushes sideways by
/// a quarter of its height so deformations are not purely planar.
pub fn bump_rig(nx: usize, ny: usize, amplitudes: &[Real]) -> Rig {
    let neutral = grid_mesh(nx, ny, 1.0);
    let width = nx.saturating_sub(1) as Real;
    let height = ny.saturating_sub(1) as Real;
    let radius = 0.4 * width.max(height).max(1.0);
    let count = amplitudes.len() as Real;

    let mut rig = Rig::new(neutral.clone());
    for (k, &a) in amplitudes.iter().enumerate() {
        let center = Pt3::new(width * (k as Real + 1.0) / (count + 1.0), 0.5 * height, 0.0);
        let offsets = bump_offsets(&neutral, center, radius, Vec3::new(0.25 * a, 0.0, a));
        // same topology by construction
        rig.push_blendshape(displaced(&neutral, &offsets), FIXED_EPS);
    }
    rig
}

/// Append one pose per weight vector, each blended from the rig itself.
pub fn add_blended_poses(rig: &mut Rig, weights: &[Weights]) -> Result<(), RigError> {
    for w in weights {
        let mesh = rig.generate_pose(w);
        rig.add_pose(mesh, w.clone())?;
    }
    Ok(())
}

/// Target rig sharing `source`'s neutral, with empty blendshapes and poses
/// copied from `source` (meshes and weights).
pub fn mirrored_target(source: &Rig) -> Result<Rig, RigError> {
    let mut target = Rig::new(source.neutral().clone());
    target.generate_empty_blendshapes(source.num_blendshapes());
    for pose in source.poses() {
        target.add_pose(pose.mesh().clone(), pose.weights().to_vec())?;
    }
    Ok(target)
}
