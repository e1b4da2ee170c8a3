//! Landmark-driven image warping.
//!
//! The pipeline fits one displacement spline per axis from the landmark
//! correspondence, evaluates both over the target grid, converts the result to
//! source pixel coordinates and resamples the source image bicubically.

use std::path::Path;

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TpsError};
use crate::grid::{dense_grid, to_pixel_maps};
use crate::remap::remap_bicubic;
use crate::spline::{
    bending_energy, coefficients_from_correspondence, evaluate, validate_correspondence,
    CoefficientForm, CoefficientPair, SplineParams,
};

/// Configuration for the warping pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpConfig {
    /// Parameters of both displacement splines.
    pub spline: SplineParams,
    /// Store coefficients in reduced form.
    pub reduced: bool,
    /// Value read for source taps outside the image.
    pub border_value: f64,
    /// Threads for dense evaluation and resampling. 0 uses the global rayon pool.
    pub jobs: usize,
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            spline: SplineParams::default(),
            reduced: true,
            border_value: 0.0,
            jobs: 0,
        }
    }
}

impl WarpConfig {
    /// Parses and validates a JSON configuration. Missing keys take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| TpsError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.spline.validate()?;
        if !self.border_value.is_finite() {
            return Err(TpsError::config(format!(
                "border value must be finite, got {}",
                self.border_value
            )));
        }
        Ok(())
    }

    /// Coefficient storage form selected by `reduced`.
    pub fn form(&self) -> CoefficientForm {
        if self.reduced {
            CoefficientForm::Reduced
        } else {
            CoefficientForm::Full
        }
    }
}

/// How well the fitted deformation maps destination landmarks onto their
/// source counterparts.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkResiduals {
    /// Euclidean error per landmark, in normalized units.
    pub errors: Array1<f64>,
    pub rmse: f64,
    pub max_error: f64,
}

/// Diagnostics of a single warp.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpReport {
    pub target_shape: (usize, usize),
    pub residuals: LandmarkResiduals,
    pub bending_energy_x: f64,
    pub bending_energy_y: f64,
}

/// Warps `image` so that `src_landmarks` land on `dst_landmarks`, using the
/// default configuration.
///
/// # Arguments
/// * `image` - Source image, `H x W x C`.
/// * `src_landmarks` - `n x 2` normalized landmark coordinates in the source.
/// * `dst_landmarks` - `n x 2` normalized coordinates of the same landmarks in
///   the reference frame.
/// * `target_shape` - Output `(height, width)`; the source shape when `None`.
pub fn warp(
    image: ArrayView3<f64>,
    src_landmarks: ArrayView2<f64>,
    dst_landmarks: ArrayView2<f64>,
    target_shape: Option<(usize, usize)>,
) -> Result<Array3<f64>> {
    warp_with_config(
        image,
        src_landmarks,
        dst_landmarks,
        target_shape,
        &WarpConfig::default(),
    )
}

/// Same as [`warp`] with an explicit configuration.
pub fn warp_with_config(
    image: ArrayView3<f64>,
    src_landmarks: ArrayView2<f64>,
    dst_landmarks: ArrayView2<f64>,
    target_shape: Option<(usize, usize)>,
    config: &WarpConfig,
) -> Result<Array3<f64>> {
    let (warped, _) = run_pipeline(image, src_landmarks, dst_landmarks, target_shape, config)?;
    Ok(warped)
}

/// Warps a single-channel `H x W` image.
pub fn warp_gray(
    image: ArrayView2<f64>,
    src_landmarks: ArrayView2<f64>,
    dst_landmarks: ArrayView2<f64>,
    target_shape: Option<(usize, usize)>,
    config: &WarpConfig,
) -> Result<Array2<f64>> {
    let warped = warp_with_config(
        image.insert_axis(Axis(2)),
        src_landmarks,
        dst_landmarks,
        target_shape,
        config,
    )?;
    Ok(warped.index_axis_move(Axis(2), 0))
}

/// Warps the image and reports landmark residuals and bending energy.
pub fn warp_with_report(
    image: ArrayView3<f64>,
    src_landmarks: ArrayView2<f64>,
    dst_landmarks: ArrayView2<f64>,
    target_shape: Option<(usize, usize)>,
    config: &WarpConfig,
) -> Result<(Array3<f64>, WarpReport)> {
    let (warped, pair) =
        run_pipeline(image, src_landmarks, dst_landmarks, target_shape, config)?;

    let residuals = landmark_residuals(&pair, src_landmarks, dst_landmarks)?;
    let report = WarpReport {
        target_shape: (warped.dim().0, warped.dim().1),
        bending_energy_x: bending_energy(&pair.dx, dst_landmarks)?,
        bending_energy_y: bending_energy(&pair.dy, dst_landmarks)?,
        residuals,
    };
    info!(
        rmse = report.residuals.rmse,
        max_error = report.residuals.max_error,
        bending_x = report.bending_energy_x,
        bending_y = report.bending_energy_y,
        "warp report"
    );
    Ok((warped, report))
}

/// Maps every destination landmark through the fitted displacement field and
/// measures how far it lands from its source landmark.
pub fn landmark_residuals(
    pair: &CoefficientPair,
    src_landmarks: ArrayView2<f64>,
    dst_landmarks: ArrayView2<f64>,
) -> Result<LandmarkResiduals> {
    validate_correspondence(&src_landmarks, &dst_landmarks)?;

    let dx = evaluate(dst_landmarks, dst_landmarks, &pair.dx)?;
    let dy = evaluate(dst_landmarks, dst_landmarks, &pair.dy)?;

    let errors = Array1::from_shape_fn(dst_landmarks.nrows(), |i| {
        let ex = dst_landmarks[[i, 0]] + dx[i] - src_landmarks[[i, 0]];
        let ey = dst_landmarks[[i, 1]] + dy[i] - src_landmarks[[i, 1]];
        (ex * ex + ey * ey).sqrt()
    });
    let rmse = (errors.mapv(|e| e * e).sum() / errors.len() as f64).sqrt();
    let max_error = errors.fold(0.0_f64, |m, &e| m.max(e));

    Ok(LandmarkResiduals {
        errors,
        rmse,
        max_error,
    })
}

fn run_pipeline(
    image: ArrayView3<f64>,
    src_landmarks: ArrayView2<f64>,
    dst_landmarks: ArrayView2<f64>,
    target_shape: Option<(usize, usize)>,
    config: &WarpConfig,
) -> Result<(Array3<f64>, CoefficientPair)> {
    config.validate()?;

    let (src_h, src_w, channels) = image.dim();
    if src_h == 0 || src_w == 0 || channels == 0 {
        return Err(TpsError::InvalidDimensions(format!(
            "source image must be non-empty, got {}x{}x{}",
            src_h, src_w, channels
        )));
    }
    let target_shape = target_shape.unwrap_or((src_h, src_w));

    info!(
        src_h,
        src_w,
        channels,
        target_h = target_shape.0,
        target_w = target_shape.1,
        landmarks = dst_landmarks.nrows(),
        "warping image"
    );

    let pair = coefficients_from_correspondence(
        src_landmarks,
        dst_landmarks,
        &config.spline,
        config.form(),
    )?;

    let warped = with_thread_pool(config.jobs, || {
        let grid = dense_grid(&pair, dst_landmarks, target_shape)?;
        let maps = to_pixel_maps(&grid, (src_h, src_w));
        debug!(map_h = maps.shape().0, map_w = maps.shape().1, "pixel maps ready");
        remap_bicubic(image, &maps, config.border_value)
    })?;

    Ok((warped, pair))
}

/// Runs `op` on a dedicated pool of `jobs` threads, or on the global rayon
/// pool when `jobs` is 0.
fn with_thread_pool<T, F>(jobs: usize, op: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    if jobs == 0 {
        return op();
    }
    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    pool.install(op)
}
