//! Bicubic resampling through pixel maps.

use ndarray::{Array3, ArrayView3, ArrayViewMut2, Axis};
use rayon::prelude::*;

use crate::error::{Result, TpsError};
use crate::grid::PixelMaps;

/// Free parameter of the Keys cubic convolution kernel.
pub const CUBIC_A: f64 = -0.75;

/// Cubic convolution weight for a tap at signed distance `t`.
pub fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t <= 1.0 {
        ((CUBIC_A + 2.0) * t - (CUBIC_A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((CUBIC_A * t - 5.0 * CUBIC_A) * t + 8.0 * CUBIC_A) * t - 4.0 * CUBIC_A
    } else {
        0.0
    }
}

/// Weights of the four taps at offsets -1, 0, 1, 2 for a fractional position.
/// The last weight closes the partition of unity.
fn cubic_coefficients(frac: f64) -> [f64; 4] {
    let c0 = cubic_weight(frac + 1.0);
    let c1 = cubic_weight(frac);
    let c2 = cubic_weight(1.0 - frac);
    [c0, c1, c2, 1.0 - c0 - c1 - c2]
}

/// Resamples `image` at the coordinates in `maps` with bicubic interpolation.
///
/// # Arguments
/// * `image` - Source image, `H x W x C`.
/// * `maps` - Source pixel coordinates for every destination pixel.
/// * `border_value` - Value read for taps outside the source image.
///
/// # Returns
/// The resampled image, shaped like the maps with the source channel count.
/// Coordinates outside the image are not an error; their taps read
/// `border_value`, and non-finite coordinates produce `border_value`.
pub fn remap_bicubic(
    image: ArrayView3<f64>,
    maps: &PixelMaps,
    border_value: f64,
) -> Result<Array3<f64>> {
    if maps.map_x.dim() != maps.map_y.dim() {
        let (xh, xw) = maps.map_x.dim();
        let (yh, yw) = maps.map_y.dim();
        return Err(TpsError::shape("pixel maps", &[xh, xw], &[yh, yw]));
    }
    let (src_h, src_w, channels) = image.dim();
    if src_h == 0 || src_w == 0 || channels == 0 {
        return Err(TpsError::InvalidDimensions(format!(
            "source image must be non-empty, got {}x{}x{}",
            src_h, src_w, channels
        )));
    }

    let (out_h, out_w) = maps.shape();
    let mut out = Array3::<f64>::zeros((out_h, out_w, channels));

    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, row)| remap_row(&image, maps, border_value, i, row));

    Ok(out)
}

fn remap_row(
    image: &ArrayView3<f64>,
    maps: &PixelMaps,
    border_value: f64,
    i: usize,
    mut row: ArrayViewMut2<f64>,
) {
    let (src_h, src_w, channels) = image.dim();
    let (src_h, src_w) = (src_h as i64, src_w as i64);

    for j in 0..row.nrows() {
        let x = maps.map_x[[i, j]] as f64;
        let y = maps.map_y[[i, j]] as f64;
        if !x.is_finite() || !y.is_finite() {
            row.row_mut(j).fill(border_value);
            continue;
        }

        let (x0, y0) = (x.floor(), y.floor());
        let (ix, iy) = (x0 as i64, y0 as i64);

        // Whole 4x4 neighborhood outside the image.
        if ix + 2 < 0 || iy + 2 < 0 || ix - 1 >= src_w || iy - 1 >= src_h {
            row.row_mut(j).fill(border_value);
            continue;
        }

        let wx = cubic_coefficients(x - x0);
        let wy = cubic_coefficients(y - y0);

        for c in 0..channels {
            let mut acc = 0.0;
            for (ky, wyk) in wy.iter().enumerate() {
                let sy = iy + ky as i64 - 1;
                let mut row_acc = 0.0;
                for (kx, wxk) in wx.iter().enumerate() {
                    let sx = ix + kx as i64 - 1;
                    let v = if sx < 0 || sy < 0 || sx >= src_w || sy >= src_h {
                        border_value
                    } else {
                        image[[sy as usize, sx as usize, c]]
                    };
                    row_acc += wxk * v;
                }
                acc += wyk * row_acc;
            }
            row[[j, c]] = acc;
        }
    }
}
