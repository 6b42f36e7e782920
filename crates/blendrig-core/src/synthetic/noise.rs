//! Deterministic noise helpers for synthetic rigs.
//!
//! The functions here avoid `thread_rng` and do not depend on the internal
//! algorithm of `rand` RNGs. This keeps synthetic rigs stable across
//! versions and platforms.

use crate::{Mesh, Real, Vec3};

/// Deterministic uniform vertex noise in `[-max_abs, +max_abs]` per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformVertexNoise {
    /// Base seed controlling the pseudo-random sequence.
    pub seed: u64,
    /// Maximum absolute per-axis displacement.
    pub max_abs: Real,
}

impl Default for UniformVertexNoise {
    fn default() -> Self {
        Self {
            seed: 0,
            max_abs: 0.0,
        }
    }
}

impl UniformVertexNoise {
    /// Sample a displacement for a given `(mesh_idx, vertex)` key.
    #[inline]
    pub fn sample(&self, mesh_idx: usize, vertex: usize) -> Vec3 {
        let max_abs = self.max_abs.abs();
        if max_abs == 0.0 {
            return Vec3::zeros();
        }

        let key = mix_key(self.seed, mesh_idx, vertex);
        let x = u64_to_unit_f64(splitmix64(key));
        let y = u64_to_unit_f64(splitmix64(key ^ 0x94D0_49BB_1331_11EB));
        let z = u64_to_unit_f64(splitmix64(key ^ 0xD6E8_FEB8_6659_FD93));

        // [0, 1) -> [-max_abs, +max_abs]
        Vec3::new(x - 0.5, y - 0.5, z - 0.5) * (2.0 * max_abs)
    }

    /// Perturb every vertex of `mesh`.
    pub fn apply(&self, mesh_idx: usize, mesh: &mut Mesh) {
        for (v, p) in mesh.positions_mut().iter_mut().enumerate() {
            *p += self.sample(mesh_idx, v);
        }
    }
}

#[inline]
fn mix_key(seed: u64, mesh_idx: usize, vertex: usize) -> u64 {
    seed ^ (mesh_idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (vertex as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn u64_to_unit_f64(x: u64) -> Real {
    // top 53 bits -> [0, 1)
    let mantissa = x >> 11;
    (mantissa as Real) * (1.0 / ((1u64 << 53) as Real))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::grid_mesh;

    #[test]
    fn vertex_noise_is_deterministic_and_bounded() {
        let noise = UniformVertexNoise {
            seed: 123,
            max_abs: 0.05,
        };

        let a = noise.sample(0, 0);
        assert_eq!(a, noise.sample(0, 0));
        assert_ne!(a, noise.sample(0, 1));
        assert!(a.amax() <= 0.05);

        let mut mesh = grid_mesh(3, 3, 1.0);
        let before = mesh.clone();
        noise.apply(2, &mut mesh);
        assert_ne!(mesh, before);
        assert!(mesh.same_topology(&before));
    }

    #[test]
    fn zero_amplitude_is_a_no_op() {
        let noise = UniformVertexNoise::default();
        assert_eq!(noise.sample(4, 9), Vec3::zeros());
    }
}
