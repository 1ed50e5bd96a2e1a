//! Perceiver-style bottleneck: a learned latent bank attends over the patch
//! tokens, bounding every later sequence length to the latent-token count
//! regardless of image resolution.

use candle_core::{Module, Result, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

use super::attention::multi_head_attention;
use super::mlp::Mlp;

/// Cross-attention from latent queries to patch-token keys/values.
///
/// Query and target tokens have independent widths; the q/k projections map
/// into `qk_dim` and the value projection into `v_dim`, with the output
/// projected back to the query width. Pre-norm on both residual paths.
pub struct LatentCrossAttention {
    norm1: LayerNorm,
    norm2: LayerNorm,
    q: Linear,
    k: Linear,
    v: Linear,
    proj: Linear,
    ffn: Mlp,
    num_heads: usize,
}

impl LatentCrossAttention {
    pub fn new(
        qk_dim: usize,
        v_dim: usize,
        query_token_dim: usize,
        tgt_token_dim: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if qk_dim % num_heads != 0 {
            candle_core::bail!("qk_dim {qk_dim} not divisible by {num_heads} heads");
        }
        if v_dim % num_heads != 0 {
            candle_core::bail!("v_dim {v_dim} not divisible by {num_heads} heads");
        }
        Ok(Self {
            norm1: layer_norm(query_token_dim, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(query_token_dim, 1e-5, vb.pp("norm2"))?,
            q: linear(query_token_dim, qk_dim, vb.pp("q"))?,
            k: linear(tgt_token_dim, qk_dim, vb.pp("k"))?,
            v: linear(tgt_token_dim, v_dim, vb.pp("v"))?,
            proj: linear(v_dim, query_token_dim, vb.pp("proj"))?,
            ffn: Mlp::new_sequential(query_token_dim, query_token_dim, vb.pp("ffn"))?,
            num_heads,
        })
    }

    /// `query`: `[1, k, query_dim]` latent bank (broadcast over the batch) or
    /// an already-batched `[b, k, query_dim]`; `tgt`: `[b, m, tgt_dim]`.
    /// Output: `[b, k, query_dim]`.
    pub fn forward(&self, query: &Tensor, tgt: &Tensor) -> Result<Tensor> {
        let (b, _m, _td) = tgt.dims3()?;
        let (qb, n, qd) = query.dims3()?;
        let query = if qb == b {
            query.clone()
        } else if qb == 1 {
            query.expand((b, n, qd))?.contiguous()?
        } else {
            candle_core::bail!("query batch {qb} is neither 1 nor the target batch {b}")
        };

        let short_cut = &query;
        let x = self.norm1.forward(&query)?;
        let q = self.q.forward(&x)?;
        let k = self.k.forward(tgt)?;
        let v = self.v.forward(tgt)?;
        let x = multi_head_attention(&q, &k, &v, self.num_heads)?;
        let x = (short_cut + self.proj.forward(&x)?)?;
        &x + self.ffn.forward(&self.norm2.forward(&x)?)?
    }
}
