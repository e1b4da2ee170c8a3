//! Sampling grids and pixel maps.
//!
//! Grids hold normalized `(x, y)` coordinates in an `H x W x 2` array. The
//! identity grid spans [0, 1] on both axes; the dense grid produced from a
//! fitted correspondence gives, for every destination pixel, the normalized
//! source coordinate to sample (inverse warp).

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Zip};
use tracing::debug;

use crate::error::{Result, TpsError};
use crate::spline::{evaluate, CoefficientPair};

/// A `H x W x 2` grid of normalized `(x, y)` sampling coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingGrid {
    coords: Array3<f64>,
}

impl SamplingGrid {
    /// Wraps an existing coordinate array, checking it is `H x W x 2` with
    /// non-zero `H` and `W`.
    pub fn from_array(coords: Array3<f64>) -> Result<Self> {
        let (h, w, c) = coords.dim();
        if c != 2 {
            return Err(TpsError::shape("sampling grid", &[h, w, 2], &[h, w, c]));
        }
        if h == 0 || w == 0 {
            return Err(TpsError::InvalidDimensions(format!(
                "sampling grid must be non-empty, got {}x{}",
                h, w
            )));
        }
        Ok(Self { coords })
    }

    /// `(height, width)` of the grid.
    pub fn shape(&self) -> (usize, usize) {
        let (h, w, _) = self.coords.dim();
        (h, w)
    }

    pub fn view(&self) -> ArrayView3<'_, f64> {
        self.coords.view()
    }

    /// The x channel.
    pub fn x(&self) -> ArrayView2<'_, f64> {
        self.coords.slice(s![.., .., 0])
    }

    /// The y channel.
    pub fn y(&self) -> ArrayView2<'_, f64> {
        self.coords.slice(s![.., .., 1])
    }

    /// Flattens the grid into a row-major `(H * W) x 2` list of points.
    pub fn to_points(&self) -> Array2<f64> {
        let (h, w) = self.shape();
        Array2::from_shape_fn((h * w, 2), |(k, c)| self.coords[[k / w, k % w, c]])
    }

    pub fn into_inner(self) -> Array3<f64> {
        self.coords
    }
}

/// Source-image pixel coordinates for every destination pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMaps {
    pub map_x: Array2<f32>,
    pub map_y: Array2<f32>,
}

impl PixelMaps {
    /// `(height, width)` of the destination image the maps describe.
    pub fn shape(&self) -> (usize, usize) {
        self.map_x.dim()
    }
}

/// Position `idx` of `len` evenly spaced samples over [0, 1].
fn unit_linspace(idx: usize, len: usize) -> f64 {
    if len <= 1 {
        0.0
    } else {
        idx as f64 / (len - 1) as f64
    }
}

/// Uniform grid coordinates.
///
/// # Arguments
/// * `height`, `width` - Number of grid rows and columns.
///
/// # Returns
/// A grid where entry `[i, j]` is `(j / (W - 1), i / (H - 1))`: x varies along
/// columns, y along rows, both spanning [0, 1] inclusive.
pub fn uniform_grid(height: usize, width: usize) -> Result<SamplingGrid> {
    if height == 0 || width == 0 {
        return Err(TpsError::InvalidDimensions(format!(
            "grid must be at least 1x1, got {}x{}",
            height, width
        )));
    }
    let coords = Array3::from_shape_fn((height, width, 2), |(i, j, c)| match c {
        0 => unit_linspace(j, width),
        _ => unit_linspace(i, height),
    });
    SamplingGrid::from_array(coords)
}

/// Evaluates the displacement splines over a full target grid.
///
/// # Arguments
/// * `coeffs` - The x- and y-displacement splines.
/// * `dst_points` - The destination landmarks the splines were fitted at.
/// * `target_shape` - `(height, width)` of the destination image.
///
/// # Returns
/// The identity grid plus the evaluated displacements, i.e. the normalized
/// source coordinate for every destination pixel.
pub fn dense_grid(
    coeffs: &CoefficientPair,
    dst_points: ArrayView2<f64>,
    target_shape: (usize, usize),
) -> Result<SamplingGrid> {
    let (height, width) = target_shape;
    let identity = uniform_grid(height, width)?;
    let queries = identity.to_points();

    let dx = evaluate(queries.view(), dst_points, &coeffs.dx)?
        .into_shape_with_order((height, width))?;
    let dy = evaluate(queries.view(), dst_points, &coeffs.dy)?
        .into_shape_with_order((height, width))?;

    let mut coords = identity.into_inner();
    Zip::from(coords.slice_mut(s![.., .., 0]))
        .and(&dx)
        .for_each(|c, &d| *c += d);
    Zip::from(coords.slice_mut(s![.., .., 1]))
        .and(&dy)
        .for_each(|c, &d| *c += d);

    debug!(height, width, controls = dst_points.nrows(), "built dense sampling grid");
    SamplingGrid::from_array(coords)
}

/// Converts a normalized grid into pixel maps for a source image.
///
/// # Arguments
/// * `grid` - Normalized sampling coordinates, e.g. from [`dense_grid`].
/// * `source_shape` - `(height, width)` of the source image in pixels.
///
/// # Returns
/// `map_x = x * width` and `map_y = y * height`, shaped like the grid.
pub fn to_pixel_maps(grid: &SamplingGrid, source_shape: (usize, usize)) -> PixelMaps {
    let (src_h, src_w) = source_shape;
    let map_x = grid.x().mapv(|x| (x * src_w as f64) as f32);
    let map_y = grid.y().mapv(|y| (y * src_h as f64) as f32);
    PixelMaps { map_x, map_y }
}
