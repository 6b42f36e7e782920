//! Triangulated surface with per-vertex positions.
//!
//! Every blendshape and pose of a rig owns a full copy of its mesh. Meshes of
//! one rig share the neutral's triangle list, so vertex and face indices are
//! interchangeable between them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Pt3, Real, Vec3};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshError {
    #[error("triangle {face} references vertex {vertex}, but the mesh has {num_vertices} vertices")]
    VertexOutOfRange {
        face: usize,
        vertex: usize,
        num_vertices: usize,
    },
    #[error("expected {expected} positions, got {got}")]
    PositionCount { expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    positions: Vec<Pt3>,
    triangles: Vec<[usize; 3]>,
}

impl Mesh {
    /// Build a mesh, checking that every triangle references a valid vertex.
    pub fn new(positions: Vec<Pt3>, triangles: Vec<[usize; 3]>) -> Result<Self, MeshError> {
        let num_vertices = positions.len();
        for (face, tri) in triangles.iter().enumerate() {
            if let Some(&vertex) = tri.iter().find(|&&v| v >= num_vertices) {
                return Err(MeshError::VertexOutOfRange {
                    face,
                    vertex,
                    num_vertices,
                });
            }
        }
        Ok(Self {
            positions,
            triangles,
        })
    }

    /// Build a mesh whose triangles are valid by construction.
    pub(crate) fn from_raw(positions: Vec<Pt3>, triangles: Vec<[usize; 3]>) -> Self {
        Self {
            positions,
            triangles,
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.positions.len()
    }

    pub fn num_faces(&self) -> usize {
        self.triangles.len()
    }

    pub fn positions(&self) -> &[Pt3] {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut [Pt3] {
        &mut self.positions
    }

    pub fn position(&self, vertex: usize) -> &Pt3 {
        &self.positions[vertex]
    }

    pub fn set_position(&mut self, vertex: usize, p: Pt3) {
        self.positions[vertex] = p;
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    pub fn triangle(&self, face: usize) -> [usize; 3] {
        self.triangles[face]
    }

    /// Corner positions of one face.
    pub fn face_points(&self, face: usize) -> [Pt3; 3] {
        let [a, b, c] = self.triangles[face];
        [self.positions[a], self.positions[b], self.positions[c]]
    }

    /// Same vertex count and identical triangle list.
    pub fn same_topology(&self, other: &Mesh) -> bool {
        self.positions.len() == other.positions.len() && self.triangles == other.triangles
    }

    /// Copy of this mesh with new positions and the same triangles.
    pub fn with_positions(&self, positions: Vec<Pt3>) -> Result<Self, MeshError> {
        if positions.len() != self.positions.len() {
            return Err(MeshError::PositionCount {
                expected: self.positions.len(),
                got: positions.len(),
            });
        }
        Ok(Self {
            positions,
            triangles: self.triangles.clone(),
        })
    }

    /// Per-vertex displacement `self - base`.
    ///
    /// Both meshes must have the same vertex count.
    pub fn offsets_from(&self, base: &Mesh) -> Vec<Vec3> {
        debug_assert_eq!(self.num_vertices(), base.num_vertices());
        self.positions
            .iter()
            .zip(base.positions.iter())
            .map(|(p, q)| p - q)
            .collect()
    }

    /// Add `weight * offset` to every vertex.
    pub fn add_scaled_offsets(&mut self, offsets: &[Vec3], weight: Real) {
        for (p, d) in self.positions.iter_mut().zip(offsets.iter()) {
            *p += d * weight;
        }
    }

    /// Faces incident to any of `vertices`, sorted and deduplicated.
    pub fn faces_around(&self, vertices: &[usize]) -> Vec<usize> {
        let mut touched = vec![false; self.positions.len()];
        for &v in vertices {
            if let Some(flag) = touched.get_mut(v) {
                *flag = true;
            }
        }
        self.triangles
            .iter()
            .enumerate()
            .filter(|(_, tri)| tri.iter().any(|&v| touched[v]))
            .map(|(face, _)| face)
            .collect()
    }

    /// Vertices used by any of `faces`, sorted and deduplicated.
    pub fn vertices_of(&self, faces: &[usize]) -> Vec<usize> {
        let mut vertices: Vec<usize> = faces
            .iter()
            .flat_map(|&f| self.triangles[f].iter().copied())
            .collect();
        vertices.sort_unstable();
        vertices.dedup();
        vertices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> Mesh {
        Mesh::new(
            vec![
                Pt3::new(0.0, 0.0, 0.0),
                Pt3::new(1.0, 0.0, 0.0),
                Pt3::new(1.0, 1.0, 0.0),
                Pt3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
        .unwrap()
    }

    #[test]
    fn rejects_out_of_range_triangles() {
        let err = Mesh::new(vec![Pt3::origin(); 2], vec![[0, 1, 2]]).unwrap_err();
        assert_eq!(
            err,
            MeshError::VertexOutOfRange {
                face: 0,
                vertex: 2,
                num_vertices: 2
            }
        );
    }

    #[test]
    fn adjacency_queries() {
        let mesh = quad();
        assert_eq!(mesh.faces_around(&[1]), vec![0]);
        assert_eq!(mesh.faces_around(&[0]), vec![0, 1]);
        assert_eq!(mesh.vertices_of(&[1]), vec![0, 2, 3]);
    }

    #[test]
    fn offsets_and_accumulation() {
        let base = quad();
        let mut moved = base.clone();
        moved.set_position(2, Pt3::new(1.0, 1.0, 0.5));
        let offsets = moved.offsets_from(&base);
        assert_eq!(offsets[2], Vec3::new(0.0, 0.0, 0.5));

        let mut half = base.clone();
        half.add_scaled_offsets(&offsets, 0.5);
        assert!((half.position(2).z - 0.25).abs() < 1e-12);
        assert!(half.same_topology(&base));
    }
}
