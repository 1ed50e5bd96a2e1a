//! Named shape transitions used across the encoder.
//!
//! Every reshape that changes which axis means "source pixel", "latent
//! token", or "spatial position" lives here as a pure function with a
//! round-trip test, so axis semantics stay explicit at the call sites.

use candle_core::{Result, Tensor};

/// Zero-pad a `[b, h, w, c]` grid on the bottom/right so `h` and `w` become
/// multiples of `m`. Returns the padded tensor and the (pad_h, pad_w) amounts.
pub fn pad_to_multiple(x: &Tensor, m: usize) -> Result<(Tensor, usize, usize)> {
    let (_b, h, w, _c) = x.dims4()?;
    let pad_h = (m - h % m) % m;
    let pad_w = (m - w % m) % m;
    let x = if pad_h > 0 || pad_w > 0 {
        x.pad_with_zeros(1, 0, pad_h)?.pad_with_zeros(2, 0, pad_w)?
    } else {
        x.clone()
    };
    Ok((x, pad_h, pad_w))
}

/// Exact inverse of [`pad_to_multiple`]: crop the bottom/right padding away.
pub fn crop_padding(x: &Tensor, pad_h: usize, pad_w: usize) -> Result<Tensor> {
    let (_b, h, w, _c) = x.dims4()?;
    if pad_h == 0 && pad_w == 0 {
        return Ok(x.clone());
    }
    x.narrow(1, 0, h - pad_h)?.narrow(2, 0, w - pad_w)?.contiguous()
}

/// Reshape the 6D cost volume so every source pixel becomes one cost-map
/// "image": `[b, heads, h1, w1, h2, w2]` -> `[b*h1*w1, heads, h2, w2]`.
///
/// Source pixels stay in raster order along the new batch axis.
pub fn cost_volume_to_cost_maps(cost_volume: &Tensor) -> Result<Tensor> {
    let dims = cost_volume.dims();
    let [b, heads, h1, w1, h2, w2]: [usize; 6] = dims
        .try_into()
        .map_err(|_| candle_core::Error::Msg(format!("expected 6D cost volume, got {dims:?}")))?;
    cost_volume
        .permute((0, 2, 3, 1, 4, 5))?
        .contiguous()?
        .reshape((b * h1 * w1, heads, h2, w2))
}

/// Swap the latent-token axis into the batch so the spatial grid becomes the
/// sequence: `[b*h1w1, k, d]` -> `[b*k, h1w1, d]`.
pub fn latent_to_spatial_major(x: &Tensor, b: usize, h1w1: usize) -> Result<Tensor> {
    let (bhw, k, d) = x.dims3()?;
    if bhw != b * h1w1 {
        candle_core::bail!("token batch {bhw} does not factor into {b} x {h1w1}");
    }
    x.reshape((b, h1w1, k, d))?
        .permute((0, 2, 1, 3))?
        .contiguous()?
        .reshape((b * k, h1w1, d))
}

/// Exact inverse of [`latent_to_spatial_major`]:
/// `[b*k, h1w1, d]` -> `[b*h1w1, k, d]`.
pub fn spatial_to_latent_major(x: &Tensor, b: usize, k: usize) -> Result<Tensor> {
    let (bk, h1w1, d) = x.dims3()?;
    if bk != b * k {
        candle_core::bail!("token batch {bk} does not factor into {b} x {k}");
    }
    x.reshape((b, k, h1w1, d))?
        .permute((0, 2, 1, 3))?
        .contiguous()?
        .reshape((b * h1w1, k, d))
}

/// Partition a `[b, h, w, c]` grid into non-overlapping `ws` x `ws` windows:
/// `[b, nh, nw, ws, ws, c]`. The grid must already be a multiple of `ws`.
pub fn window_partition(x: &Tensor, ws: usize) -> Result<Tensor> {
    let (b, h, w, c) = x.dims4()?;
    if h % ws != 0 || w % ws != 0 {
        candle_core::bail!("grid {h}x{w} is not a multiple of window size {ws}");
    }
    x.reshape((b, h / ws, ws, w / ws, ws, c))?
        .permute((0, 1, 3, 2, 4, 5))?
        .contiguous()
}

/// Reassemble windows back into the full grid:
/// `[b, nh, nw, ws, ws, c]` -> `[b, nh*ws, nw*ws, c]`.
pub fn window_unpartition(windows: &Tensor) -> Result<Tensor> {
    let dims = windows.dims();
    let [b, nh, nw, ws, ws2, c]: [usize; 6] = dims
        .try_into()
        .map_err(|_| candle_core::Error::Msg(format!("expected 6D windows, got {dims:?}")))?;
    if ws != ws2 {
        candle_core::bail!("windows must be square, got {ws}x{ws2}");
    }
    windows
        .permute((0, 1, 3, 2, 4, 5))?
        .contiguous()?
        .reshape((b, nh * ws, nw * ws, c))
}
