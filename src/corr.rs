//! All-pairs correlation (cost) volume between two feature maps.

use candle_core::{Result, Tensor};

/// Builds the 6D cost volume `[b, heads, h, w, h, w]` from two feature maps.
///
/// Channels are split into `heads` groups and, per head, every source-pixel
/// feature vector is dotted against every target-pixel feature vector in one
/// batched matmul. Correlation is the raw dot product: no normalization and
/// no `1/sqrt(d)` scaling here (scaling only exists inside the downstream
/// attention blocks, and the decoder is tuned to this scale).
///
/// Peak memory is the output itself: `b * heads * (h*w)^2 * 4` bytes in f32,
/// quadratic in the spatial resolution. [`CorrBlock::volume_chunked`]
/// computes the identical tensor in head-group slices to bound the size of
/// the intermediate matmul buffers.
#[derive(Debug, Clone)]
pub struct CorrBlock {
    heads: usize,
}

impl CorrBlock {
    pub fn new(heads: usize) -> Self {
        Self { heads }
    }

    /// `fmap1`, `fmap2`: `[b, c, h, w]` with identical shapes and
    /// `c % heads == 0`. Output: `[b, heads, h, w, h, w]`, addressable as
    /// (source row, source col, target row, target col).
    pub fn volume(&self, fmap1: &Tensor, fmap2: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = self.check_inputs(fmap1, fmap2)?;
        let d = c / self.heads;

        // [b, heads*d, h, w] -> [b*heads, h*w, d]
        let f1 = to_head_tokens(fmap1, b, self.heads, d, h, w)?;
        let f2 = to_head_tokens(fmap2, b, self.heads, d, h, w)?;

        let corr = f1.matmul(&f2.transpose(1, 2)?)?; // [b*heads, h*w, h*w]
        corr.reshape((b, self.heads, h, w, h, w))
    }

    /// Same result as [`Self::volume`], computed `heads_per_chunk` head
    /// groups at a time and concatenated along the head axis.
    pub fn volume_chunked(
        &self,
        fmap1: &Tensor,
        fmap2: &Tensor,
        heads_per_chunk: usize,
    ) -> Result<Tensor> {
        if heads_per_chunk == 0 {
            candle_core::bail!("heads_per_chunk must be non-zero");
        }
        let (b, c, h, w) = self.check_inputs(fmap1, fmap2)?;
        let d = c / self.heads;

        let mut chunks = Vec::new();
        let mut head = 0;
        while head < self.heads {
            let n = heads_per_chunk.min(self.heads - head);
            // Narrow the channel axis to the head group's d*n channels.
            let f1 = fmap1.narrow(1, head * d, n * d)?;
            let f2 = fmap2.narrow(1, head * d, n * d)?;
            let f1 = to_head_tokens(&f1, b, n, d, h, w)?;
            let f2 = to_head_tokens(&f2, b, n, d, h, w)?;
            let corr = f1.matmul(&f2.transpose(1, 2)?)?;
            chunks.push(corr.reshape((b, n, h, w, h, w))?);
            head += n;
        }
        Tensor::cat(&chunks, 1)
    }

    fn check_inputs(&self, fmap1: &Tensor, fmap2: &Tensor) -> Result<(usize, usize, usize, usize)> {
        let (b, c, h, w) = fmap1.dims4()?;
        if fmap2.dims() != fmap1.dims() {
            candle_core::bail!(
                "feature map shapes disagree: {:?} vs {:?}",
                fmap1.dims(),
                fmap2.dims()
            );
        }
        if h == 0 || w == 0 {
            candle_core::bail!("feature maps must have non-zero spatial size, got {h}x{w}");
        }
        if c % self.heads != 0 {
            candle_core::bail!("channels {c} not divisible by {} correlation heads", self.heads);
        }
        Ok((b, c, h, w))
    }
}

/// `[b, heads*d, h, w]` -> `[b*heads, h*w, d]`, pixels in raster order.
fn to_head_tokens(
    fmap: &Tensor,
    b: usize,
    heads: usize,
    d: usize,
    h: usize,
    w: usize,
) -> Result<Tensor> {
    fmap.reshape((b, heads, d, h * w))?
        .permute((0, 1, 3, 2))?
        .contiguous()?
        .reshape((b * heads, h * w, d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp, Tensor};

    fn randn_fmap(b: usize, c: usize, h: usize, w: usize, device: &Device) -> Tensor {
        Tensor::randn(0f32, 1.0, (b, c, h, w), device).unwrap()
    }

    #[test]
    fn volume_shape() {
        let device = Device::Cpu;
        let f1 = randn_fmap(2, 8, 3, 4, &device);
        let f2 = randn_fmap(2, 8, 3, 4, &device);
        let corr = CorrBlock::new(2).volume(&f1, &f2).unwrap();
        assert_eq!(corr.dims(), &[2, 2, 3, 4, 3, 4]);
    }

    #[test]
    fn self_similarity_diagonal() {
        let device = Device::Cpu;
        let (heads, h, w) = (2, 3, 3);
        let f = randn_fmap(1, 8, h, w, &device);
        let corr = CorrBlock::new(heads).volume(&f, &f).unwrap();
        let d = 8 / heads;

        for hd in 0..heads {
            for i in 0..h {
                for j in 0..w {
                    // Per-head feature vector of pixel (i, j).
                    let feat: Vec<f32> = f
                        .i((0, hd * d..(hd + 1) * d, i, j))
                        .unwrap()
                        .flatten_all()
                        .unwrap()
                        .to_vec1()
                        .unwrap();
                    let expect: f32 = feat.iter().map(|v| v * v).sum();
                    let got: f32 = corr
                        .i((0, hd, i, j, i, j))
                        .unwrap()
                        .to_scalar()
                        .unwrap();
                    assert!(
                        (expect - got).abs() < 1e-4,
                        "diagonal mismatch at head {hd} pixel ({i},{j}): {expect} vs {got}"
                    );
                }
            }
        }
    }

    #[test]
    fn correlation_is_bilinear() {
        let device = Device::Cpu;
        let f1 = randn_fmap(1, 4, 2, 2, &device);
        let f2 = randn_fmap(1, 4, 2, 2, &device);
        let block = CorrBlock::new(1);

        let base: Vec<f32> = block
            .volume(&f1, &f2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let scaled: Vec<f32> = block
            .volume(&(&f1 * 3.0).unwrap(), &f2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (a, b) in base.iter().zip(scaled.iter()) {
            assert!((3.0 * a - b).abs() < 1e-4, "expected 3*{a}, got {b}");
        }
    }

    #[test]
    fn chunked_matches_full() {
        let device = Device::Cpu;
        let f1 = randn_fmap(1, 12, 3, 2, &device);
        let f2 = randn_fmap(1, 12, 3, 2, &device);
        let block = CorrBlock::new(4);

        let full: Vec<f32> = block
            .volume(&f1, &f2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for chunk in [1, 2, 3, 4] {
            let chunked: Vec<f32> = block
                .volume_chunked(&f1, &f2, chunk)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            assert_eq!(full, chunked, "chunk size {chunk} changed the volume");
        }
    }

    #[test]
    fn mismatched_shapes_rejected() {
        let device = Device::Cpu;
        let f1 = randn_fmap(1, 8, 4, 4, &device);
        let f2 = randn_fmap(1, 8, 4, 5, &device);
        assert!(CorrBlock::new(2).volume(&f1, &f2).is_err());
    }

    #[test]
    fn zero_spatial_size_rejected() {
        let device = Device::Cpu;
        let f1 = Tensor::zeros((1, 8, 0, 4), DType::F32, &device).unwrap();
        let f2 = Tensor::zeros((1, 8, 0, 4), DType::F32, &device).unwrap();
        assert!(CorrBlock::new(2).volume(&f1, &f2).is_err());
    }

    #[test]
    fn indivisible_heads_rejected() {
        let device = Device::Cpu;
        let f1 = randn_fmap(1, 6, 2, 2, &device);
        let f2 = randn_fmap(1, 6, 2, 2, &device);
        assert!(CorrBlock::new(4).volume(&f1, &f2).is_err());
    }
}
