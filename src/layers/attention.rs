//! Shared scaled dot-product attention over already-projected tensors.

use candle_core::{Result, Tensor};
use candle_nn::ops::softmax_last_dim;

/// Multi-head attention on projected q/k/v.
///
/// `q`: `[b, n, qk_dim]`, `k`: `[b, m, qk_dim]`, `v`: `[b, m, v_dim]`;
/// output `[b, n, v_dim]`. Scale is `1/sqrt(qk_dim / num_heads)`, softmax
/// over keys. Both projected widths must be divisible by `num_heads` (the
/// owning layers enforce this at construction).
pub fn multi_head_attention(q: &Tensor, k: &Tensor, v: &Tensor, num_heads: usize) -> Result<Tensor> {
    let (b, n, qk_dim) = q.dims3()?;
    let (_, m, v_dim) = v.dims3()?;
    let qk_head = qk_dim / num_heads;
    let v_head = v_dim / num_heads;
    let scale = 1.0 / (qk_head as f64).sqrt();

    let q = split_heads(q, b, n, num_heads, qk_head)?;
    let k = split_heads(k, b, m, num_heads, qk_head)?;
    let v = split_heads(v, b, m, num_heads, v_head)?;

    let attn = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
    let attn = softmax_last_dim(&attn)?;
    attn.matmul(&v)?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, n, v_dim))
}

/// `[b, s, heads*head_dim]` -> `[b, heads, s, head_dim]`.
fn split_heads(x: &Tensor, b: usize, s: usize, heads: usize, head_dim: usize) -> Result<Tensor> {
    x.reshape((b, s, heads, head_dim))?.transpose(1, 2)?.contiguous()
}
