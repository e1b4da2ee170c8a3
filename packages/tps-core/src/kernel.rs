//! Pairwise distances and the thin-plate radial basis function.

use ndarray::{Array2, ArrayView2, Zip};

use crate::error::{Result, TpsError};

/// Default offset inside the logarithm of the TPS kernel.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// The TPS basis function: U(r) = r^2 * ln(r + epsilon).
///
/// The offset keeps the logarithm finite at r = 0, where the kernel evaluates
/// to zero.
pub fn tps_kernel(r: f64, epsilon: f64) -> f64 {
    r * r * (r + epsilon).ln()
}

/// Euclidean distance between `(ax, ay)` and `(bx, by)`.
#[inline]
pub(crate) fn distance(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
}

/// Computes the `p x q` matrix of distances between the rows of `a` and `b`.
///
/// Only the first two columns of each row are used, so control points may
/// carry a value column without affecting the distances.
pub fn pairwise_distance(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>> {
    require_xy("pairwise distance (a)", &a)?;
    require_xy("pairwise distance (b)", &b)?;

    let mut out = Array2::<f64>::zeros((a.nrows(), b.nrows()));
    Zip::indexed(&mut out).for_each(|(i, j), d| {
        *d = distance(a[[i, 0]], a[[i, 1]], b[[j, 0]], b[[j, 1]]);
    });
    Ok(out)
}

/// Applies [`tps_kernel`] to every entry of the pairwise distance matrix.
pub fn kernel_matrix(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    epsilon: f64,
) -> Result<Array2<f64>> {
    Ok(pairwise_distance(a, b)?.mapv_into(|r| tps_kernel(r, epsilon)))
}

/// Fails unless `points` has at least the two coordinate columns.
pub(crate) fn require_xy(context: &'static str, points: &ArrayView2<f64>) -> Result<()> {
    if points.ncols() < 2 {
        return Err(TpsError::shape(
            context,
            &[points.nrows(), 2],
            &[points.nrows(), points.ncols()],
        ));
    }
    Ok(())
}
