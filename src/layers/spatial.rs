//! Spatial attention across the (h1, w1) grid, one independent problem per
//! latent token.
//!
//! Two variants share the outer pre-norm block: locally-grouped attention
//! inside non-overlapping windows, and global attention onto a
//! strided-convolution-subsampled set of keys/values. Both take an external
//! per-pixel context feature that is projected to a narrow side channel and
//! concatenated into the query/key inputs only, plus a sinusoidal relative
//! position encoding added to the q/k inputs before projection.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, layer_norm, linear, Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};

use super::attention::multi_head_attention;
use super::mlp::Mlp;
use crate::ops::{crop_padding, pad_to_multiple, window_partition, window_unpartition};
use crate::position::{grid_position_encoding, scaled_coords, sine_position_encoding};

/// Project the context tensor to the side-channel width and align it to the
/// attention batch: `[bc, context_dim, h, w]` -> `[b, h, w, vert_c_dim]`.
///
/// The attention batch must be an exact integer multiple of the context
/// batch (each latent token sees the same tiled context); anything else is
/// rejected rather than silently truncated.
fn prepare_context(
    context: &Tensor,
    proj: &Linear,
    b: usize,
    h: usize,
    w: usize,
) -> Result<Tensor> {
    let (bc, cd, ch, cw) = context.dims4()?;
    if (ch, cw) != (h, w) {
        candle_core::bail!("context grid {ch}x{cw} does not match attention grid {h}x{w}");
    }
    if bc == 0 || b % bc != 0 {
        candle_core::bail!("attention batch {b} is not an integer multiple of context batch {bc}");
    }
    let tiled = context
        .unsqueeze(0)?
        .expand((b / bc, bc, cd, h, w))?
        .reshape((b, cd, h, w))?;
    let tokens = tiled.reshape((b, cd, h * w))?.transpose(1, 2)?.contiguous()?;
    proj.forward(&tokens)?.reshape((b, h, w, ()))
}

/// Attention restricted to non-overlapping `ws` x `ws` windows.
pub struct LocallyGroupedAttention {
    context_proj: Option<Linear>,
    q: Linear,
    k: Linear,
    v: Linear,
    proj: Linear,
    num_heads: usize,
    ws: usize,
    vert_c_dim: usize,
}

impl LocallyGroupedAttention {
    pub fn new(
        dim: usize,
        num_heads: usize,
        ws: usize,
        vert_c_dim: usize,
        context_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if ws <= 1 {
            candle_core::bail!("locally grouped attention needs a window size > 1, got {ws}");
        }
        if dim % num_heads != 0 {
            candle_core::bail!("dim {dim} not divisible by {num_heads} heads");
        }
        let context_proj = if vert_c_dim > 0 {
            Some(linear(context_dim, vert_c_dim, vb.pp("context_proj"))?)
        } else {
            None
        };
        Ok(Self {
            context_proj,
            q: linear(dim + vert_c_dim, dim, vb.pp("q"))?,
            k: linear(dim + vert_c_dim, dim, vb.pp("k"))?,
            v: linear(dim, dim, vb.pp("v"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            num_heads,
            ws,
            vert_c_dim,
        })
    }

    /// `x`: `[b, h*w, c]` over the grid `size`; `context` is required iff
    /// the layer was built with a non-zero side-channel width.
    pub fn forward(&self, x: &Tensor, size: (usize, usize), context: Option<&Tensor>) -> Result<Tensor> {
        let (b, n, c) = x.dims3()?;
        let (h, w) = size;
        if h == 0 || w == 0 || n != h * w {
            candle_core::bail!("sequence length {n} does not match grid {h}x{w}");
        }
        let c_qk = c + self.vert_c_dim;

        let x = x.reshape((b, h, w, c))?;
        let x_qk = match &self.context_proj {
            Some(proj) => {
                let context = context
                    .ok_or_else(|| candle_core::Error::Msg("context tensor required".into()))?;
                let side = prepare_context(context, proj, b, h, w)?;
                Tensor::cat(&[&x, &side], 3)?
            }
            None => x.clone(),
        };

        let (x, pad_h, pad_w) = pad_to_multiple(&x, self.ws)?;
        let (x_qk, _, _) = pad_to_multiple(&x_qk, self.ws)?;
        let (_, hp, wp, _) = x.dims4()?;
        let (nh, nw) = (hp / self.ws, wp / self.ws);
        let windows = b * nh * nw;

        // Values never see the position encoding or the context channel.
        let v_in = window_partition(&x, self.ws)?.reshape((windows, self.ws * self.ws, c))?;
        let v = self.v.forward(&v_in)?;

        // Window-local coordinates, identical for every window.
        let coords = scaled_coords(self.ws, self.ws, 1.0, x.device())?;
        let enc = sine_position_encoding(&coords, c_qk)?.reshape((1, self.ws * self.ws, c_qk))?;
        let qk_in = window_partition(&x_qk, self.ws)?
            .reshape((windows, self.ws * self.ws, c_qk))?
            .broadcast_add(&enc)?;
        let q = self.q.forward(&qk_in)?;
        let k = self.k.forward(&qk_in)?;

        let attn = multi_head_attention(&q, &k, &v, self.num_heads)?
            .reshape((b, nh, nw, self.ws, self.ws, c))?;
        let grid = window_unpartition(&attn)?;
        let grid = crop_padding(&grid, pad_h, pad_w)?;
        self.proj.forward(&grid.reshape((b, n, c))?)
    }
}

/// Full-resolution queries attending to a strided, spatially subsampled set
/// of keys/values.
pub struct GlobalSubsampledAttention {
    context_proj: Option<Linear>,
    q: Linear,
    k: Linear,
    v: Linear,
    proj: Linear,
    sr_key: Option<Conv2d>,
    sr_value: Option<Conv2d>,
    norm: Option<LayerNorm>,
    num_heads: usize,
    sr_ratio: usize,
    vert_c_dim: usize,
}

impl GlobalSubsampledAttention {
    pub fn new(
        dim: usize,
        num_heads: usize,
        sr_ratio: usize,
        vert_c_dim: usize,
        context_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if sr_ratio == 0 {
            candle_core::bail!("subsample ratio must be non-zero");
        }
        if dim % num_heads != 0 {
            candle_core::bail!("dim {dim} not divisible by {num_heads} heads");
        }
        let context_proj = if vert_c_dim > 0 {
            Some(linear(context_dim, vert_c_dim, vb.pp("context_proj"))?)
        } else {
            None
        };
        // With subsampling, the key conv folds the context channel away and
        // keys live at width `dim`; without it, keys come straight from the
        // context-concatenated input.
        let k_in_dim = if sr_ratio > 1 { dim } else { dim + vert_c_dim };
        let (sr_key, sr_value, norm) = if sr_ratio > 1 {
            let conv_cfg = Conv2dConfig {
                stride: sr_ratio,
                ..Default::default()
            };
            (
                Some(conv2d(dim + vert_c_dim, dim, sr_ratio, conv_cfg, vb.pp("sr_key"))?),
                Some(conv2d(dim, dim, sr_ratio, conv_cfg, vb.pp("sr_value"))?),
                Some(layer_norm(dim, 1e-5, vb.pp("norm"))?),
            )
        } else {
            (None, None, None)
        };
        Ok(Self {
            context_proj,
            q: linear(dim + vert_c_dim, dim, vb.pp("q"))?,
            k: linear(k_in_dim, dim, vb.pp("k"))?,
            v: linear(dim, dim, vb.pp("v"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            sr_key,
            sr_value,
            norm,
            num_heads,
            sr_ratio,
            vert_c_dim,
        })
    }

    pub fn forward(&self, x: &Tensor, size: (usize, usize), context: Option<&Tensor>) -> Result<Tensor> {
        let (b, n, c) = x.dims3()?;
        let (h, w) = size;
        if h == 0 || w == 0 || n != h * w {
            candle_core::bail!("sequence length {n} does not match grid {h}x{w}");
        }
        let c_qk = c + self.vert_c_dim;

        let x = x.reshape((b, h, w, c))?;
        let x_qk = match &self.context_proj {
            Some(proj) => {
                let context = context
                    .ok_or_else(|| candle_core::Error::Msg("context tensor required".into()))?;
                let side = prepare_context(context, proj, b, h, w)?;
                Tensor::cat(&[&x, &side], 3)?
            }
            None => x.clone(),
        };

        let (x, pad_h, pad_w) = pad_to_multiple(&x, self.sr_ratio)?;
        let (x_qk, _, _) = pad_to_multiple(&x_qk, self.sr_ratio)?;
        let (_, hp, wp, _) = x.dims4()?;

        let q_in = x_qk
            .reshape((b, hp * wp, c_qk))?
            .broadcast_add(&grid_position_encoding(hp, wp, c_qk, x.device())?)?;
        let q = self.q.forward(&q_in)?;

        // Keys/values from the subsampled grid (or the full grid at ratio 1),
        // with key coordinates rescaled back into query pixel space.
        let (hs, ws_) = (hp / self.sr_ratio, wp / self.sr_ratio);
        let (k_tokens, v_tokens) = match (&self.sr_key, &self.sr_value, &self.norm) {
            (Some(sr_key), Some(sr_value), Some(norm)) => {
                let x_nchw = x.permute((0, 3, 1, 2))?.contiguous()?;
                let x_qk_nchw = x_qk.permute((0, 3, 1, 2))?.contiguous()?;
                let v_tokens = sr_value
                    .forward(&x_nchw)?
                    .reshape((b, c, hs * ws_))?
                    .transpose(1, 2)?
                    .contiguous()?;
                let k_tokens = sr_key
                    .forward(&x_qk_nchw)?
                    .reshape((b, c, hs * ws_))?
                    .transpose(1, 2)?
                    .contiguous()?;
                (norm.forward(&k_tokens)?, norm.forward(&v_tokens)?)
            }
            _ => (x_qk.reshape((b, hp * wp, c_qk))?, x.reshape((b, hp * wp, c))?),
        };

        let key_coords = scaled_coords(hs, ws_, self.sr_ratio as f64, x.device())?;
        let key_enc = sine_position_encoding(&key_coords, k_tokens.dim(2)?)?;
        let k = self.k.forward(&k_tokens.broadcast_add(&key_enc)?)?;
        let v = self.v.forward(&v_tokens)?;

        let attn = multi_head_attention(&q, &k, &v, self.num_heads)?.reshape((b, hp, wp, c))?;
        let grid = crop_padding(&attn, pad_h, pad_w)?;
        self.proj.forward(&grid.reshape((b, n, c))?)
    }
}

/// The two interchangeable spatial attention mechanisms, selected by window
/// size: `ws > 1` runs locally-grouped windows, `ws == 1` runs the
/// global-subsampled variant.
pub enum SpatialAttention {
    Local(LocallyGroupedAttention),
    GlobalSubsampled(GlobalSubsampledAttention),
}

impl SpatialAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        num_heads: usize,
        ws: usize,
        sr_ratio: usize,
        vert_c_dim: usize,
        context_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if ws == 1 {
            Ok(Self::GlobalSubsampled(GlobalSubsampledAttention::new(
                dim,
                num_heads,
                sr_ratio,
                vert_c_dim,
                context_dim,
                vb,
            )?))
        } else {
            Ok(Self::Local(LocallyGroupedAttention::new(
                dim,
                num_heads,
                ws,
                vert_c_dim,
                context_dim,
                vb,
            )?))
        }
    }

    pub fn forward(&self, x: &Tensor, size: (usize, usize), context: Option<&Tensor>) -> Result<Tensor> {
        match self {
            Self::Local(attn) => attn.forward(x, size, context),
            Self::GlobalSubsampled(attn) => attn.forward(x, size, context),
        }
    }
}

/// Pre-norm residual wrapper around a spatial attention and a 4x MLP.
pub struct TwinsBlock {
    norm1: LayerNorm,
    norm2: LayerNorm,
    attn: SpatialAttention,
    mlp: Mlp,
}

impl TwinsBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        num_heads: usize,
        ws: usize,
        sr_ratio: usize,
        vert_c_dim: usize,
        context_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            attn: SpatialAttention::new(dim, num_heads, ws, sr_ratio, vert_c_dim, context_dim, vb.pp("attn"))?,
            mlp: Mlp::new(dim, dim * 4, vb.pp("mlp"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, size: (usize, usize), context: Option<&Tensor>) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.norm1.forward(x)?, size, context)?)?;
        &x + self.mlp.forward(&self.norm2.forward(&x)?)?
    }
}

/// One vertical encoder step: fine mixing inside windows, then coarse mixing
/// against the subsampled global summary, on the same input.
pub struct VerticalAttentionLayer {
    local_block: TwinsBlock,
    global_block: TwinsBlock,
}

impl VerticalAttentionLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        num_heads: usize,
        ws: usize,
        sr_ratio: usize,
        vert_c_dim: usize,
        context_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            local_block: TwinsBlock::new(dim, num_heads, ws, sr_ratio, vert_c_dim, context_dim, vb.pp("local_block"))?,
            global_block: TwinsBlock::new(dim, num_heads, 1, sr_ratio, vert_c_dim, context_dim, vb.pp("global_block"))?,
        })
    }

    /// `x`: `[b*k, h1w1, dim]`, `context`: `[b, context_dim, h1, w1]`.
    pub fn forward(&self, x: &Tensor, size: (usize, usize), context: Option<&Tensor>) -> Result<Tensor> {
        let x = self.local_block.forward(x, size, context)?;
        self.global_block.forward(&x, size, context)
    }
}
