//! Thin-Plate Spline (TPS) fitting and evaluation.
//!
//! A fitted spline is an affine term plus a weighted sum of radial basis
//! functions centered at the control points:
//!
//! f(x, y) = a_1 + a_x * x + a_y * y + sum_i w_i * U(|(x, y) - p_i|)
//!
//! The coefficients are obtained by solving
//! | K + lambda*I  P | | w | = | v |
//! | P.T           0 | | a |   | 0 |
//! where K holds the basis function evaluations between control points, P the
//! polynomial terms `[1, x, y]`, and v the control point values. The last three
//! rows force the weights to sum to zero, which is what allows one weight to be
//! dropped from the stored coefficients (the "reduced" form) and rebuilt later.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TpsError};
use crate::kernel::{self, distance, tps_kernel, DEFAULT_EPSILON};

/// Smallest control point count for which the TPS system is well posed.
pub const MIN_CONTROL_POINTS: usize = 3;

/// Largest accepted `|L * theta - y| / |y|` of a solved system.
const MAX_RELATIVE_RESIDUAL: f64 = 1e-6;

const SVD_MAX_ITERATIONS: usize = 10_000;

/// Parameters of a single spline fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplineParams {
    /// Added to the diagonal of K. Zero interpolates the control values exactly;
    /// larger values trade exactness for smoothness.
    pub smoothing: f64,
    /// Offset inside the kernel logarithm.
    pub epsilon: f64,
    /// Systems whose reciprocal condition number (smallest over largest
    /// singular value, after normalizing units) falls below this are reported
    /// as singular.
    pub singular_tolerance: f64,
}

impl Default for SplineParams {
    fn default() -> Self {
        Self {
            smoothing: 0.0,
            epsilon: DEFAULT_EPSILON,
            singular_tolerance: 1e-12,
        }
    }
}

impl SplineParams {
    /// Parameters with the given smoothing and default everything else.
    pub fn with_smoothing(smoothing: f64) -> Self {
        Self {
            smoothing,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.smoothing.is_finite() || self.smoothing < 0.0 {
            return Err(TpsError::config(format!(
                "smoothing must be finite and non-negative, got {}",
                self.smoothing
            )));
        }
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(TpsError::config(format!(
                "kernel epsilon must be finite and positive, got {}",
                self.epsilon
            )));
        }
        if !self.singular_tolerance.is_finite() || self.singular_tolerance < 0.0 {
            return Err(TpsError::config(format!(
                "singular tolerance must be finite and non-negative, got {}",
                self.singular_tolerance
            )));
        }
        Ok(())
    }
}

/// Storage layout of a coefficient vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoefficientForm {
    /// `[w_0..w_n-1, a_1, a_x, a_y]`, length n + 3.
    Full,
    /// `[w_1..w_n-1, a_1, a_x, a_y]`, length n + 2. `w_0` is rebuilt from the
    /// zero-sum constraint on the weights.
    Reduced,
}

impl CoefficientForm {
    /// Expected coefficient vector length for `n` control points.
    pub fn coefficient_count(self, n: usize) -> usize {
        match self {
            Self::Full => n + 3,
            Self::Reduced => n + 2,
        }
    }
}

/// Fitted coefficients (theta) of one scalar spline.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineCoefficients {
    values: DVector<f64>,
    form: CoefficientForm,
    epsilon: f64,
}

impl SplineCoefficients {
    /// Wraps an existing coefficient vector. `epsilon` must be the kernel offset
    /// the coefficients were fitted with.
    ///
    /// Fails when the vector is too short to describe a spline over
    /// [`MIN_CONTROL_POINTS`] control points.
    pub fn from_parts(
        values: DVector<f64>,
        form: CoefficientForm,
        epsilon: f64,
    ) -> Result<Self> {
        let min_len = form.coefficient_count(MIN_CONTROL_POINTS);
        if values.len() < min_len {
            return Err(TpsError::CoefficientLength {
                form,
                expected: min_len,
                actual: values.len(),
            });
        }
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(TpsError::config(format!(
                "kernel epsilon must be finite and positive, got {}",
                epsilon
            )));
        }
        Ok(Self {
            values,
            form,
            epsilon,
        })
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn form(&self) -> CoefficientForm {
        self.form
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The affine coefficients `[a_1, a_x, a_y]`.
    pub fn affine(&self) -> [f64; 3] {
        let len = self.values.len();
        [
            self.values[len - 3],
            self.values[len - 2],
            self.values[len - 1],
        ]
    }

    /// Returns the full weight vector for `n` control points, rebuilding the
    /// dropped weight when the coefficients are stored in reduced form.
    pub fn weights(&self, n: usize) -> Result<DVector<f64>> {
        let expected = self.form.coefficient_count(n);
        if n == 0 || self.values.len() != expected {
            return Err(TpsError::CoefficientLength {
                form: self.form,
                expected,
                actual: self.values.len(),
            });
        }

        match self.form {
            CoefficientForm::Full => Ok(self.values.rows(0, n).into_owned()),
            CoefficientForm::Reduced => {
                let stored = self.values.rows(0, n - 1);
                let mut weights = DVector::<f64>::zeros(n);
                weights[0] = -stored.sum();
                weights.rows_mut(1, n - 1).copy_from(&stored);
                Ok(weights)
            }
        }
    }

    /// Converts to full form. Fails if the length does not match `n`.
    pub fn to_full(&self, n: usize) -> Result<Self> {
        let weights = self.weights(n)?;
        let [a1, ax, ay] = self.affine();
        let mut values = DVector::<f64>::zeros(n + 3);
        values.rows_mut(0, n).copy_from(&weights);
        values[n] = a1;
        values[n + 1] = ax;
        values[n + 2] = ay;
        Self::from_parts(values, CoefficientForm::Full, self.epsilon)
    }
}

/// The x- and y-displacement splines of one correspondence set.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientPair {
    pub dx: SplineCoefficients,
    pub dy: SplineCoefficients,
}

/// Fits a Thin-Plate Spline to a set of control points.
///
/// # Arguments
/// * `points` - `n x k` array with `k >= 3`: columns 0 and 1 are the `(x, y)`
///   coordinates and the last column is the value to interpolate.
/// * `params` - Smoothing, kernel offset and singularity tolerance.
/// * `form` - Whether to return the full or the reduced coefficient vector.
///
/// # Returns
/// The fitted coefficients `[w..., a_1, a_x, a_y]`, or `TpsError::SingularSystem`
/// when the system cannot be solved reliably (coincident, nearly coincident or
/// collinear control points with zero smoothing).
pub fn fit(
    points: ArrayView2<f64>,
    params: &SplineParams,
    form: CoefficientForm,
) -> Result<SplineCoefficients> {
    params.validate()?;

    let n = points.nrows();
    if points.ncols() < 3 {
        return Err(TpsError::shape(
            "control points",
            &[n, 3],
            &[n, points.ncols()],
        ));
    }
    if n < MIN_CONTROL_POINTS {
        return Err(TpsError::TooFewPoints {
            required: MIN_CONTROL_POINTS,
            actual: n,
        });
    }
    if params.smoothing == 0.0 {
        if let Some((i, j)) = find_coincident(&points) {
            return Err(TpsError::singular(format!(
                "control points {} and {} coincide; use a non-zero smoothing to regularize",
                i, j
            )));
        }
    }

    let value_col = points.ncols() - 1;
    let m_size = n + 3; // n weights + 3 affine coefficients

    // The system is assembled in normalized units: the affine columns use
    // coordinates centered on the control points and scaled to unit spread,
    // and K is divided by its largest entry. Both are exact changes of
    // variables, undone below, so the conditioning test does not depend on
    // whether landmarks are given in normalized or pixel coordinates.
    let frame = AffineFrame::from_points(&points);
    let kernel = kernel::kernel_matrix(points, points, params.epsilon)?;
    let kernel_scale = kernel
        .iter()
        .fold(params.smoothing, |acc, k| acc.max(k.abs()));
    let kernel_scale = if kernel_scale > 0.0 && kernel_scale.is_finite() {
        kernel_scale
    } else {
        1.0
    };

    // --- Build the y vector ---
    let mut y_vector = DVector::<f64>::zeros(m_size);
    for i in 0..n {
        y_vector[i] = points[[i, value_col]];
    }

    // --- Build the L matrix ---
    let mut l_matrix = DMatrix::<f64>::zeros(m_size, m_size);

    // K (top-left, n x n) with the smoothing term on its diagonal.
    for r in 0..n {
        for c in 0..n {
            l_matrix[(r, c)] = kernel[[r, c]] / kernel_scale;
        }
        l_matrix[(r, r)] += params.smoothing / kernel_scale;
    }

    // P (top-right, n x 3) and P.T (bottom-left, 3 x n).
    for i in 0..n {
        let (x, y) = frame.to_local(points[[i, 0]], points[[i, 1]]);
        l_matrix[(i, n)] = 1.0;
        l_matrix[(i, n + 1)] = x;
        l_matrix[(i, n + 2)] = y;
        l_matrix[(n, i)] = 1.0;
        l_matrix[(n + 1, i)] = x;
        l_matrix[(n + 2, i)] = y;
    }
    // The bottom-right 3x3 block remains zero.

    // Reciprocal condition number from the singular values. LU pivots can
    // stay large for nearly coincident control points, singular values do not.
    let singular_values = l_matrix
        .clone()
        .try_svd(false, false, f64::EPSILON, SVD_MAX_ITERATIONS)
        .ok_or_else(|| TpsError::singular("singular value decomposition did not converge"))?
        .singular_values;
    let (min_sigma, max_sigma) = singular_values
        .iter()
        .fold((f64::INFINITY, 0.0_f64), |(lo, hi), s| (lo.min(*s), hi.max(*s)));
    let rcond = if max_sigma > 0.0 {
        min_sigma / max_sigma
    } else {
        0.0
    };
    if rcond.is_nan() || rcond < params.singular_tolerance {
        warn!(n, min_sigma, max_sigma, "TPS system rejected as singular");
        return Err(TpsError::singular(format!(
            "reciprocal condition number {:e} is below tolerance {:e}; control points may be collinear or nearly coincident",
            rcond, params.singular_tolerance
        )));
    }

    let solution = l_matrix.clone().lu().solve(&y_vector).ok_or_else(|| {
        TpsError::singular("failed to solve TPS linear system; the matrix is singular")
    })?;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(TpsError::singular(
            "TPS solution contains non-finite coefficients",
        ));
    }

    let residual = (&l_matrix * &solution - &y_vector).norm();
    let rhs_norm = y_vector.norm();
    if residual > MAX_RELATIVE_RESIDUAL * rhs_norm {
        warn!(n, residual, rhs_norm, "TPS solution does not satisfy its system");
        return Err(TpsError::singular(format!(
            "relative residual {:e} exceeds {:e}",
            residual / rhs_norm.max(f64::MIN_POSITIVE),
            MAX_RELATIVE_RESIDUAL
        )));
    }

    // Back to the units of the input coordinates.
    let mut theta = DVector::<f64>::zeros(m_size);
    for i in 0..n {
        theta[i] = solution[i] / kernel_scale;
    }
    let [a1, ax, ay] = frame.to_global([solution[n], solution[n + 1], solution[n + 2]]);
    theta[n] = a1;
    theta[n + 1] = ax;
    theta[n + 2] = ay;

    debug!(
        n,
        smoothing = params.smoothing,
        rcond,
        ?form,
        "fitted thin-plate spline"
    );

    let values = match form {
        CoefficientForm::Full => theta,
        CoefficientForm::Reduced => theta.rows(1, m_size - 1).into_owned(),
    };
    SplineCoefficients::from_parts(values, form, params.epsilon)
}

/// Evaluates a fitted Thin-Plate Spline at new locations.
///
/// # Arguments
/// * `query_points` - `m x k` array (`k >= 2`) of locations to evaluate at.
/// * `control_points` - The control points the spline was fitted to.
/// * `theta` - The fitted coefficients, in either form.
///
/// # Returns
/// The spline values at `query_points`, or a shape error if the inputs are
/// inconsistent with each other.
pub fn evaluate(
    query_points: ArrayView2<f64>,
    control_points: ArrayView2<f64>,
    theta: &SplineCoefficients,
) -> Result<Array1<f64>> {
    kernel::require_xy("query points", &query_points)?;
    kernel::require_xy("control points", &control_points)?;

    let n = control_points.nrows();
    let weights = theta.weights(n)?;
    let [a1, ax, ay] = theta.affine();
    let epsilon = theta.epsilon();

    let mut out = Array1::<f64>::zeros(query_points.nrows());
    Zip::from(&mut out)
        .and(query_points.rows())
        .par_for_each(|val, q| {
            let (ex, ey) = (q[0], q[1]);
            // Start with the affine part of the model.
            let mut acc = a1 + ax * ex + ay * ey;
            // Add the contribution from each control point's radial basis function.
            for (i, c) in control_points.rows().into_iter().enumerate() {
                acc += weights[i] * tps_kernel(distance(ex, ey, c[0], c[1]), epsilon);
            }
            *val = acc;
        });
    Ok(out)
}

/// Fits the x- and y-displacement splines for a landmark correspondence.
///
/// The splines interpolate `src - dst` at the destination landmarks, so the
/// resulting field maps destination coordinates back to source coordinates.
///
/// # Arguments
/// * `src_points` - `n x 2` landmark coordinates in the source image.
/// * `dst_points` - `n x 2` matching landmark coordinates in the reference image.
pub fn coefficients_from_correspondence(
    src_points: ArrayView2<f64>,
    dst_points: ArrayView2<f64>,
    params: &SplineParams,
    form: CoefficientForm,
) -> Result<CoefficientPair> {
    validate_correspondence(&src_points, &dst_points)?;

    let delta = &src_points - &dst_points;
    let n = dst_points.nrows();
    let control_for = |axis: usize| -> Array2<f64> {
        Array2::from_shape_fn((n, 3), |(i, k)| match k {
            0 | 1 => dst_points[[i, k]],
            _ => delta[[i, axis]],
        })
    };

    let dx = fit(control_for(0).view(), params, form)?;
    let dy = fit(control_for(1).view(), params, form)?;
    Ok(CoefficientPair { dx, dy })
}

/// Bending energy `w.T * K * w` of a fitted spline.
///
/// Purely affine fields have zero bending energy; the value grows with the
/// amount of non-rigid deformation the weights encode.
pub fn bending_energy(
    theta: &SplineCoefficients,
    control_points: ArrayView2<f64>,
) -> Result<f64> {
    let n = control_points.nrows();
    let weights = theta.weights(n)?;
    let kernel = kernel::kernel_matrix(control_points, control_points, theta.epsilon())?;

    let mut energy = 0.0;
    for i in 0..n {
        for j in 0..n {
            energy += weights[i] * kernel[[i, j]] * weights[j];
        }
    }
    Ok(energy)
}

/// Checks that two landmark sets form a usable correspondence.
pub(crate) fn validate_correspondence(
    src_points: &ArrayView2<f64>,
    dst_points: &ArrayView2<f64>,
) -> Result<()> {
    let sets = [
        ("source landmarks", src_points.dim()),
        ("destination landmarks", dst_points.dim()),
    ];
    for (context, (rows, cols)) in sets {
        if cols != 2 {
            return Err(TpsError::shape(context, &[rows, 2], &[rows, cols]));
        }
    }
    if src_points.nrows() != dst_points.nrows() {
        return Err(TpsError::shape(
            "landmark correspondence",
            &[src_points.nrows(), 2],
            &[dst_points.nrows(), 2],
        ));
    }
    if src_points.nrows() < MIN_CONTROL_POINTS {
        return Err(TpsError::TooFewPoints {
            required: MIN_CONTROL_POINTS,
            actual: src_points.nrows(),
        });
    }
    Ok(())
}

/// Centroid and spread of a control point set, used to express the affine
/// part of the system in unit-free coordinates.
struct AffineFrame {
    cx: f64,
    cy: f64,
    scale: f64,
}

impl AffineFrame {
    fn from_points(points: &ArrayView2<f64>) -> Self {
        let n = points.nrows() as f64;
        let cx = points.column(0).sum() / n;
        let cy = points.column(1).sum() / n;
        let spread = points
            .rows()
            .into_iter()
            .map(|p| (p[0] - cx).powi(2) + (p[1] - cy).powi(2))
            .sum::<f64>()
            / n;
        let scale = spread.sqrt();
        Self {
            cx,
            cy,
            scale: if scale > 0.0 && scale.is_finite() {
                scale
            } else {
                1.0
            },
        }
    }

    fn to_local(&self, x: f64, y: f64) -> (f64, f64) {
        ((x - self.cx) / self.scale, (y - self.cy) / self.scale)
    }

    /// Maps `[a_1, a_x, a_y]` from local to input coordinates.
    fn to_global(&self, [b1, bx, by]: [f64; 3]) -> [f64; 3] {
        let ax = bx / self.scale;
        let ay = by / self.scale;
        [b1 - ax * self.cx - ay * self.cy, ax, ay]
    }
}

/// Returns the first pair of control points sharing the same `(x, y)`.
fn find_coincident(points: &ArrayView2<f64>) -> Option<(usize, usize)> {
    let n = points.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            if points[[i, 0]] == points[[j, 0]] && points[[i, 1]] == points[[j, 1]] {
                return Some((i, j));
            }
        }
    }
    None
}
