//! Coordinate grids and the shared sinusoidal 2D position encoding.
//!
//! The same encoding is used for patch-token centers, window-local
//! coordinates inside the local spatial attention, and the full-grid /
//! rescaled-key coordinates inside the global spatial attention.

use candle_core::{DType, Device, Result, Tensor};

/// Per-band frequency step. The reference network bakes in `3.14` (not pi)
/// and a `1/200` normalizer sized for 8x-downsampled feature grids; both are
/// load-bearing for checkpoint compatibility and must not be "corrected".
const FREQ_SCALE: f64 = 3.14 / 200.0;

/// Raster-order (x, y) pixel coordinates of an `h` x `w` grid.
///
/// Returns `[h*w, 2]` f32, row-major: entry `r*w + c` holds `(c, r)`.
pub fn coords_grid(h: usize, w: usize, device: &Device) -> Result<Tensor> {
    let ys = Tensor::arange(0f32, h as f32, device)?
        .reshape((h, 1))?
        .broadcast_as((h, w))?;
    let xs = Tensor::arange(0f32, w as f32, device)?
        .reshape((1, w))?
        .broadcast_as((h, w))?;
    Tensor::stack(&[&xs, &ys], 2)?.reshape((h * w, 2))
}

/// Linear-frequency sinusoidal encoding of 2D coordinates.
///
/// `coords`: `[b, n, 2]` as (x, y). Output: `[b, n, dim]`, laid out as
/// `[sin(x*f), cos(x*f), sin(y*f), cos(y*f)]` over `dim/4` frequency bands
/// `f = k * 3.14/200`, `k = 0..dim/4`.
pub fn sine_position_encoding(coords: &Tensor, dim: usize) -> Result<Tensor> {
    if dim % 4 != 0 {
        candle_core::bail!("position encoding dim {dim} must be divisible by 4");
    }
    let (_b, _n, two) = coords.dims3()?;
    if two != 2 {
        candle_core::bail!("expected (x, y) coordinate pairs, got last dim {two}");
    }
    let bands = dim / 4;
    let device = coords.device();
    let freq = (Tensor::arange(0f32, bands as f32, device)? * FREQ_SCALE)?
        .reshape((1, 1, bands))?
        .to_dtype(coords.dtype())?;

    let x = coords.narrow(2, 0, 1)?.broadcast_mul(&freq)?;
    let y = coords.narrow(2, 1, 1)?.broadcast_mul(&freq)?;
    Tensor::cat(&[x.sin()?, x.cos()?, y.sin()?, y.cos()?], 2)
}

/// `coords_grid` pre-shaped for encoding: `[1, h*w, 2]`, optionally scaled.
pub fn scaled_coords(h: usize, w: usize, scale: f64, device: &Device) -> Result<Tensor> {
    let coords = coords_grid(h, w, device)?.unsqueeze(0)?;
    if scale == 1.0 {
        Ok(coords)
    } else {
        coords * scale
    }
}

/// Encoding of a grid's own coordinates: `[1, h*w, dim]`.
pub fn grid_position_encoding(h: usize, w: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let coords = coords_grid(h, w, device)?
        .unsqueeze(0)?
        .to_dtype(DType::F32)?;
    sine_position_encoding(&coords, dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    #[test]
    fn coords_grid_raster_order() {
        let device = Device::Cpu;
        let grid = coords_grid(2, 3, &device).unwrap();
        assert_eq!(grid.dims(), &[6, 2]);
        let values: Vec<f32> = grid.flatten_all().unwrap().to_vec1().unwrap();
        // (x, y) pairs: row 0 then row 1
        assert_eq!(
            values,
            vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0]
        );
    }

    #[test]
    fn encoding_shape_and_zero_coordinate() {
        let device = Device::Cpu;
        let coords = Tensor::zeros((1, 3, 2), DType::F32, &device).unwrap();
        let enc = sine_position_encoding(&coords, 16).unwrap();
        assert_eq!(enc.dims(), &[1, 3, 16]);

        // sin(0) = 0 for the first quarter, cos(0) = 1 for the second
        let values: Vec<f32> = enc.i((0, 0)).unwrap().to_vec1().unwrap();
        for &v in &values[0..4] {
            assert!(v.abs() < 1e-7);
        }
        for &v in &values[4..8] {
            assert!((v - 1.0).abs() < 1e-7);
        }
    }

    #[test]
    fn encoding_rejects_width_not_multiple_of_four() {
        let device = Device::Cpu;
        let coords = Tensor::zeros((1, 1, 2), DType::F32, &device).unwrap();
        assert!(sine_position_encoding(&coords, 30).is_err());
    }

    #[test]
    fn key_coords_rescaling_aligns_with_queries() {
        let device = Device::Cpu;
        // Subsampled grid scaled by the ratio lands on the full grid's lattice.
        let scaled = scaled_coords(2, 2, 2.0, &device).unwrap();
        let values: Vec<f32> = scaled.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![0.0, 0.0, 2.0, 0.0, 0.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn encoding_is_deterministic() {
        let device = Device::Cpu;
        let coords = Tensor::arange(0f32, 8.0, &device)
            .unwrap()
            .reshape((1, 4, 2))
            .unwrap();
        let a: Vec<f32> = sine_position_encoding(&coords, 32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = sine_position_encoding(&coords, 32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }
}
