//! Finite-difference Jacobians.

use blendrig_core::{DMat, DVec, Real};

/// Relative step of the forward-difference scheme.
pub const FORWARD_STEP: Real = 1e-7;

/// Forward-difference Jacobian of `f` at `x`, given `r0 = f(x)`.
///
/// Column `j` uses the step `FORWARD_STEP * max(1, |x_j|)`.
pub fn forward_difference<F>(f: F, x: &DVec, r0: &DVec) -> DMat
where
    F: Fn(&DVec) -> DVec,
{
    let mut j = DMat::zeros(r0.len(), x.len());
    let mut shifted = x.clone();
    for col in 0..x.len() {
        let h = FORWARD_STEP * x[col].abs().max(1.0);
        shifted[col] = x[col] + h;
        let r = f(&shifted);
        shifted[col] = x[col];
        j.column_mut(col).copy_from(&((r - r0) / h));
    }
    j
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_analytic_derivative() {
        let f = |p: &DVec| DVec::from_vec(vec![p[0] * p[0], 3.0 * p[1] - p[0], p[1].sin()]);
        let x = DVec::from_vec(vec![1.5, 0.3]);
        let j = forward_difference(f, &x, &f(&x));
        let expected = DMat::from_row_slice(3, 2, &[3.0, 0.0, -1.0, 3.0, 0.0, 0.3_f64.cos()]);
        assert!(
            (j - expected).amax() < 1e-5,
            "finite differences drifted from the analytic Jacobian"
        );
    }
}
