//! Position-wise feed-forward block shared by the attention layers.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

/// Two-layer GELU MLP. The Twins blocks use a 4x hidden expansion, the
/// latent layers a 1x (no expansion), matching the reference network.
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn new(dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(dim, hidden_dim, vb.pp("fc1"))?,
            fc2: linear(hidden_dim, dim, vb.pp("fc2"))?,
        })
    }

    /// Same block with the reference checkpoint's sequential naming
    /// (`{prefix}.0` / `{prefix}.3`, GELU and dropout slots unnumbered).
    pub fn new_sequential(dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(dim, hidden_dim, vb.pp("0"))?,
            fc2: linear(hidden_dim, dim, vb.pp("3"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn forward_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mlp = Mlp::new(16, 64, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &device).unwrap();
        let out = mlp.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 5, 16]);
    }
}
