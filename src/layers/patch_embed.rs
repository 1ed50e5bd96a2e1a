//! Tokenizes per-pixel cost maps into a coarse grid of patch tokens.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, layer_norm, Conv2d, Conv2dConfig, LayerNorm, VarBuilder};

use crate::position::{coords_grid, sine_position_encoding};

/// Cost-map tokenizer.
///
/// Pads the map to a multiple of the patch size, downsamples 8x with three
/// stride-2 convolutions, then concatenates a sinusoidal encoding of each
/// coarse cell's center coordinate *in the original cost-map pixel space*
/// (`grid_index * patch_size + patch_size/2`) before a two-layer 1x1-conv
/// transform and a LayerNorm. Tokens come out at `2 * embed_dim`.
pub struct PatchEmbed {
    proj: [Conv2d; 3],
    ffn_with_coord: [Conv2d; 2],
    norm: LayerNorm,
    patch_size: usize,
    embed_dim: usize,
}

impl PatchEmbed {
    pub fn new(in_chans: usize, embed_dim: usize, patch_size: usize, vb: VarBuilder) -> Result<Self> {
        if patch_size != 8 {
            candle_core::bail!(
                "the three-stage stride-2 tokenizer downsamples by 8, got patch_size {patch_size}"
            );
        }
        let stage_cfg = Conv2dConfig {
            padding: 2,
            stride: 2,
            ..Default::default()
        };
        let proj = [
            conv2d(in_chans, embed_dim / 4, 6, stage_cfg, vb.pp("proj.0"))?,
            conv2d(embed_dim / 4, embed_dim / 2, 6, stage_cfg, vb.pp("proj.2"))?,
            conv2d(embed_dim / 2, embed_dim, 6, stage_cfg, vb.pp("proj.4"))?,
        ];
        let ffn_with_coord = [
            conv2d(embed_dim * 2, embed_dim * 2, 1, Default::default(), vb.pp("ffn_with_coord.0"))?,
            conv2d(embed_dim * 2, embed_dim * 2, 1, Default::default(), vb.pp("ffn_with_coord.2"))?,
        ];
        let norm = layer_norm(embed_dim * 2, 1e-5, vb.pp("norm"))?;
        Ok(Self {
            proj,
            ffn_with_coord,
            norm,
            patch_size,
            embed_dim,
        })
    }

    /// `x`: `[b, in_chans, h, w]` -> `([b, h3*w3, 2*embed_dim], (h3, w3))`
    /// where `(h3, w3)` is the coarse token grid after padding and 8x
    /// downsampling.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, (usize, usize))> {
        let (b, _c, h, w) = x.dims4()?;
        if h == 0 || w == 0 {
            candle_core::bail!("cost map must have non-zero spatial size, got {h}x{w}");
        }

        let pad_b = (self.patch_size - h % self.patch_size) % self.patch_size;
        let pad_r = (self.patch_size - w % self.patch_size) % self.patch_size;
        let x = if pad_b > 0 || pad_r > 0 {
            x.pad_with_zeros(2, 0, pad_b)?.pad_with_zeros(3, 0, pad_r)?
        } else {
            x.clone()
        };

        let mut feat = x;
        for (i, conv) in self.proj.iter().enumerate() {
            feat = conv.forward(&feat)?;
            if i + 1 < self.proj.len() {
                feat = feat.relu()?;
            }
        }
        let (_, _, h3, w3) = feat.dims4()?;

        // Token centers in original pixel coordinates.
        let centers = ((coords_grid(h3, w3, feat.device())?.unsqueeze(0)? * self.patch_size as f64)?
            + (self.patch_size as f64 / 2.0))?;
        let enc = sine_position_encoding(&centers, self.embed_dim)?; // [1, h3*w3, dim]
        let enc = enc
            .transpose(1, 2)?
            .reshape((1, self.embed_dim, h3, w3))?
            .expand((b, self.embed_dim, h3, w3))?;

        let mut tokens = Tensor::cat(&[&feat, &enc], 1)?;
        tokens = self.ffn_with_coord[0].forward(&tokens)?.relu()?;
        tokens = self.ffn_with_coord[1].forward(&tokens)?;

        // [b, 2*dim, h3, w3] -> [b, h3*w3, 2*dim]
        let tokens = tokens
            .reshape((b, self.embed_dim * 2, h3 * w3))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok((self.norm.forward(&tokens)?, (h3, w3)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn embed(in_chans: usize, dim: usize, device: &Device) -> PatchEmbed {
        let vb = VarBuilder::zeros(DType::F32, device);
        PatchEmbed::new(in_chans, dim, 8, vb).unwrap()
    }

    #[test]
    fn exact_multiple_produces_exact_grid() {
        let device = Device::Cpu;
        let pe = embed(4, 32, &device);
        let x = Tensor::randn(0f32, 1.0, (2, 4, 16, 24), &device).unwrap();
        let (tokens, (h3, w3)) = pe.forward(&x).unwrap();
        assert_eq!((h3, w3), (2, 3));
        assert_eq!(tokens.dims(), &[2, 6, 64]);
    }

    #[test]
    fn non_multiple_only_changes_token_count() {
        let device = Device::Cpu;
        let pe = embed(2, 16, &device);

        let x = Tensor::randn(0f32, 1.0, (1, 2, 17, 9), &device).unwrap();
        let (tokens, (h3, w3)) = pe.forward(&x).unwrap();
        // 17 -> 24 -> 3 cells, 9 -> 16 -> 2 cells
        assert_eq!((h3, w3), (3, 2));
        assert_eq!(tokens.dims(), &[1, 6, 32]);
    }

    #[test]
    fn internal_padding_matches_manual_zero_padding() {
        // The tokenizer's padding must be exactly a bottom/right zero pad to
        // the patch multiple: feeding the pre-padded input has to reproduce
        // every token bit-for-bit, so in-bounds values are never corrupted.
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pe = PatchEmbed::new(2, 16, 8, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 2, 17, 9), &device).unwrap();
        let x_padded = x
            .pad_with_zeros(2, 0, 7)
            .unwrap()
            .pad_with_zeros(3, 0, 7)
            .unwrap();
        assert_eq!(x_padded.dims(), &[1, 2, 24, 16]);

        let (tokens, grid) = pe.forward(&x).unwrap();
        let (tokens_manual, grid_manual) = pe.forward(&x_padded).unwrap();
        assert_eq!(grid, grid_manual);

        let a: Vec<f32> = tokens.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = tokens_manual.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_unsupported_patch_size() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        assert!(PatchEmbed::new(1, 16, 4, vb).is_err());
    }

    #[test]
    fn rejects_zero_spatial_size() {
        let device = Device::Cpu;
        let pe = embed(1, 16, &device);
        let x = Tensor::zeros((1, 1, 0, 8), DType::F32, &device).unwrap();
        assert!(pe.forward(&x).is_err());
    }

    #[test]
    fn forward_is_deterministic() {
        let device = Device::Cpu;
        let pe = embed(2, 16, &device);
        let x = Tensor::randn(0f32, 1.0, (1, 2, 16, 16), &device).unwrap();
        let a: Vec<f32> = pe.forward(&x).unwrap().0.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = pe.forward(&x).unwrap().0.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
