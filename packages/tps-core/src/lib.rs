//! # TPS Core Library
//!
//! This library registers a source image onto a reference frame from a set of
//! matching landmarks, using a thin-plate spline (TPS) deformation and bicubic
//! resampling.
//!
//! The main components are:
//! - `kernel`: pairwise distances and the radial basis function U(r) = r^2 ln(r + eps).
//! - `spline`: fitting and evaluating one scalar TPS, and fitting the x/y
//!   displacement pair of a landmark correspondence.
//! - `grid`: identity and dense sampling grids, and their conversion to pixel maps.
//! - `remap`: bicubic resampling through pixel maps with constant borders.
//! - `warp`: the end-to-end pipeline and its configuration.
//!
//! Landmarks are `n x 2` arrays of normalized `(x, y)` coordinates in [0, 1];
//! images are `H x W x C` arrays of `f64`.

pub mod error;
pub mod grid;
pub mod kernel;
pub mod remap;
pub mod spline;
pub mod warp;

pub use error::{Result, TpsError};
pub use grid::{dense_grid, to_pixel_maps, uniform_grid, PixelMaps, SamplingGrid};
pub use kernel::{kernel_matrix, pairwise_distance, tps_kernel, DEFAULT_EPSILON};
pub use remap::remap_bicubic;
pub use spline::{
    bending_energy, coefficients_from_correspondence, evaluate, fit, CoefficientForm,
    CoefficientPair, SplineCoefficients, SplineParams,
};
pub use warp::{
    landmark_residuals, warp, warp_gray, warp_with_config, warp_with_report, LandmarkResiduals,
    WarpConfig, WarpReport,
};
