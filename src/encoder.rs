//! Top-level orchestration: correlation volume -> patch tokens -> latent
//! bottleneck -> alternating latent/vertical attention stack.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d_no_bias, Conv2d, Init, VarBuilder};

use crate::config::EncoderConfig;
use crate::corr::CorrBlock;
use crate::layers::cross_attention::LatentCrossAttention;
use crate::layers::patch_embed::PatchEmbed;
use crate::layers::self_attention::SelfAttentionLayer;
use crate::layers::spatial::VerticalAttentionLayer;
use crate::ops::{cost_volume_to_cost_maps, latent_to_spatial_major, spatial_to_latent_major};

/// Everything the external flow decoder consumes: the compressed latent
/// tokens, the raw per-pixel cost maps (the decoder re-samples these directly
/// instead of recomputing correlation), and the coarse token-grid size.
pub struct CostMemory {
    /// `[b*h1*w1, cost_latent_token_num, cost_latent_dim]`
    pub tokens: Tensor,
    /// `[b*h1*w1, cost_heads_num, h2, w2]`
    pub cost_maps: Tensor,
    /// Token grid (h3, w3) produced by the patch tokenizer.
    pub grid: (usize, usize),
}

/// Compresses a 6D cost volume into a fixed-length latent token sequence.
///
/// The bottleneck bounds every attention after the correlation step to
/// either `cost_latent_token_num` tokens or one spatial window/subsampled
/// grid, so nothing downstream is quadratic in image resolution.
pub struct CostPerceiverEncoder {
    patch_embed: PatchEmbed,
    latent_tokens: Tensor,
    input_layer: LatentCrossAttention,
    encoder_layers: Vec<SelfAttentionLayer>,
    vertical_encoder_layers: Vec<VerticalAttentionLayer>,
    cost_heads_num: usize,
    cost_latent_token_num: usize,
}

impl CostPerceiverEncoder {
    pub fn new(cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embed = PatchEmbed::new(
            cfg.cost_heads_num,
            cfg.cost_latent_input_dim,
            cfg.patch_size,
            vb.pp("patch_embed"),
        )?;
        let latent_tokens = vb.get_with_hints(
            (1, cfg.cost_latent_token_num, cfg.cost_latent_dim),
            "latent_tokens",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let input_layer = LatentCrossAttention::new(
            cfg.cost_latent_dim,
            cfg.cost_latent_dim,
            cfg.cost_latent_dim,
            cfg.token_dim(),
            cfg.num_attention_heads,
            vb.pp("input_layer"),
        )?;
        let mut encoder_layers = Vec::with_capacity(cfg.encoder_depth);
        let mut vertical_encoder_layers = Vec::with_capacity(cfg.encoder_depth);
        for i in 0..cfg.encoder_depth {
            encoder_layers.push(SelfAttentionLayer::new(
                cfg.cost_latent_dim,
                cfg.num_attention_heads,
                vb.pp(format!("encoder_layers.{i}")),
            )?);
            vertical_encoder_layers.push(VerticalAttentionLayer::new(
                cfg.cost_latent_dim,
                cfg.num_attention_heads,
                cfg.window_size,
                cfg.sr_ratio,
                cfg.vert_c_dim,
                cfg.context_dim,
                vb.pp(format!("vertical_encoder_layers.{i}")),
            )?);
        }
        Ok(Self {
            patch_embed,
            latent_tokens,
            input_layer,
            encoder_layers,
            vertical_encoder_layers,
            cost_heads_num: cfg.cost_heads_num,
            cost_latent_token_num: cfg.cost_latent_token_num,
        })
    }

    /// `cost_volume`: `[b, heads, h1, w1, h2, w2]`; `context` (when the
    /// side channel is enabled): `[b, context_dim, h1, w1]`.
    pub fn forward(
        &self,
        cost_volume: &Tensor,
        context: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor, (usize, usize))> {
        let dims = cost_volume.dims();
        let [b, heads, h1, w1, _h2, _w2]: [usize; 6] = dims.try_into().map_err(|_| {
            candle_core::Error::Msg(format!("expected 6D cost volume, got {dims:?}"))
        })?;
        if heads != self.cost_heads_num {
            candle_core::bail!(
                "cost volume has {heads} heads, encoder was built for {}",
                self.cost_heads_num
            );
        }

        let cost_maps = cost_volume_to_cost_maps(cost_volume)?;
        let (tokens, grid) = self.patch_embed.forward(&cost_maps)?;
        tracing::debug!(
            batch = b,
            grid_h = grid.0,
            grid_w = grid.1,
            tokens = tokens.dim(1)?,
            "tokenized cost volume"
        );

        let mut x = self.input_layer.forward(&self.latent_tokens, &tokens)?;
        let short_cut = x.clone();

        for (layer, vert_layer) in self.encoder_layers.iter().zip(&self.vertical_encoder_layers) {
            x = layer.forward(&x)?;
            x = latent_to_spatial_major(&x, b, h1 * w1)?;
            x = vert_layer.forward(&x, (h1, w1), context)?;
            x = spatial_to_latent_major(&x, b, self.cost_latent_token_num)?;
        }

        let x = (x + short_cut)?;
        Ok((x, cost_maps, grid))
    }
}

/// Builds the correlation volume from two feature maps and runs the
/// perceiver pipeline over it.
pub struct MemoryEncoder {
    channel_convertor: Conv2d,
    corr: CorrBlock,
    cost_perceiver_encoder: CostPerceiverEncoder,
    feature_dim: usize,
}

impl MemoryEncoder {
    pub fn new(cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        Ok(Self {
            channel_convertor: conv2d_no_bias(
                cfg.feature_dim,
                cfg.feature_dim,
                1,
                Default::default(),
                vb.pp("channel_convertor"),
            )?,
            corr: CorrBlock::new(cfg.cost_heads_num),
            cost_perceiver_encoder: CostPerceiverEncoder::new(cfg, vb.pp("cost_perceiver_encoder"))?,
            feature_dim: cfg.feature_dim,
        })
    }

    /// `fmap1`, `fmap2`: `[b, feature_dim, h, w]` backbone features of the
    /// two images; `context`: per-pixel features of the first image.
    pub fn forward(
        &self,
        fmap1: &Tensor,
        fmap2: &Tensor,
        context: Option<&Tensor>,
    ) -> Result<CostMemory> {
        let (b, c, h, w) = fmap1.dims4()?;
        if c != self.feature_dim {
            candle_core::bail!("feature maps have {c} channels, expected {}", self.feature_dim);
        }
        let fmap1 = self.channel_convertor.forward(fmap1)?;
        let fmap2 = self.channel_convertor.forward(fmap2)?;

        let cost_volume = self.corr.volume(&fmap1, &fmap2)?;
        tracing::debug!(
            batch = b,
            height = h,
            width = w,
            bytes = cost_volume.elem_count() * 4,
            "built cost volume"
        );

        let (tokens, cost_maps, grid) = self.cost_perceiver_encoder.forward(&cost_volume, context)?;
        Ok(CostMemory {
            tokens,
            cost_maps,
            grid,
        })
    }
}
