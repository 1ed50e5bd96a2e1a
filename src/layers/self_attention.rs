//! Self-attention over the latent-token axis, applied independently per
//! source pixel (the batch axis is `b * h1 * w1`).

use candle_core::{Module, Result, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

use super::attention::multi_head_attention;
use super::mlp::Mlp;

/// Pre-norm multi-head self-attention with a 1x feed-forward block; same
/// residual wiring as [`super::cross_attention::LatentCrossAttention`] with
/// q/k/v all derived from the input.
pub struct SelfAttentionLayer {
    norm1: LayerNorm,
    norm2: LayerNorm,
    q: Linear,
    k: Linear,
    v: Linear,
    proj: Linear,
    ffn: Mlp,
    num_heads: usize,
}

impl SelfAttentionLayer {
    pub fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if dim % num_heads != 0 {
            candle_core::bail!("dim {dim} not divisible by {num_heads} heads");
        }
        Ok(Self {
            norm1: layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            q: linear(dim, dim, vb.pp("q"))?,
            k: linear(dim, dim, vb.pp("k"))?,
            v: linear(dim, dim, vb.pp("v"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            ffn: Mlp::new_sequential(dim, dim, vb.pp("ffn"))?,
            num_heads,
        })
    }

    /// `x`: `[b*h1w1, k, dim]` -> same shape.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let short_cut = x;
        let normed = self.norm1.forward(x)?;
        let q = self.q.forward(&normed)?;
        let k = self.k.forward(&normed)?;
        let v = self.v.forward(&normed)?;
        let attn = multi_head_attention(&q, &k, &v, self.num_heads)?;
        let x = (short_cut + self.proj.forward(&attn)?)?;
        &x + self.ffn.forward(&self.norm2.forward(&x)?)?
    }
}
