use nalgebra::{DMatrix, DVector, Matrix3, Point3, Vector3};

pub type Real = f64;

pub type Vec3 = Vector3<Real>;
pub type Pt3 = Point3<Real>;
pub type Mat3 = Matrix3<Real>;
pub type DMat = DMatrix<Real>;
pub type DVec = DVector<Real>;

/// Number of scalar entries in a flattened 3x3 frame.
pub const FRAME_SIZE: usize = 9;

/// Returns `true` when every component of `v` is strictly inside `(-eps, eps)`.
#[inline]
pub fn is_near_zero(v: &Vec3, eps: Real) -> bool {
    v.x.abs() < eps && v.y.abs() < eps && v.z.abs() < eps
}

/// Column-major flattening of a 3x3 matrix (`index = col * 3 + row`).
#[inline]
pub fn flatten_frame(m: &Mat3) -> [Real; FRAME_SIZE] {
    let mut out = [0.0; FRAME_SIZE];
    out.copy_from_slice(m.as_slice());
    out
}

/// Inverse of [`flatten_frame`].
#[inline]
pub fn unflatten_frame(values: &[Real]) -> Mat3 {
    debug_assert_eq!(values.len(), FRAME_SIZE);
    Mat3::from_column_slice(values)
}

/// Segment length when `len` ordered items are split into contiguous,
/// non-overlapping runs across `workers` threads.
#[inline]
pub fn segment_len(len: usize, workers: usize) -> usize {
    len / workers.max(1) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_is_column_major() {
        let m = Mat3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0);
        let flat = flatten_frame(&m);
        assert_eq!(flat[0], 1.0);
        assert_eq!(flat[1], 4.0);
        assert_eq!(flat[3], 2.0);
        assert_eq!(unflatten_frame(&flat), m);
    }

    #[test]
    fn segments_cover_every_item() {
        for (len, workers) in [(0, 4), (7, 4), (8, 4), (100, 3), (5, 0)] {
            let seg = segment_len(len, workers);
            assert!(seg * workers.max(1) >= len, "len {len} workers {workers}");
        }
    }

    #[test]
    fn near_zero_is_strict_per_component() {
        assert!(is_near_zero(&Vec3::new(0.1, -0.1, 0.0), 0.5));
        assert!(!is_near_zero(&Vec3::new(0.5, 0.0, 0.0), 0.5));
    }
}
