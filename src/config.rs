use serde::Deserialize;
use thiserror::Error;

/// Configuration surface of the cost-volume encoder.
///
/// Most fields determine parameter shapes: latent token count/dims, head
/// counts, patch size, and also `sr_ratio` (the kernel of the key/value
/// subsampling convs) and whether `window_size` is 1 (which swaps the local
/// spatial variant for the global-subsampled one). Only changes among
/// `window_size` values greater than 1 leave every parameter shape intact,
/// so checkpoints round-trip across those.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Channel width of the two input feature maps.
    pub feature_dim: usize,
    /// Channel width of the externally supplied context tensor.
    pub context_dim: usize,
    /// Number of correlation heads partitioning `feature_dim`.
    pub cost_heads_num: usize,
    /// Working width of the patch tokenizer (tokens come out at twice this).
    pub cost_latent_input_dim: usize,
    /// Number of learned latent tokens in the bottleneck.
    pub cost_latent_token_num: usize,
    /// Width of each latent token.
    pub cost_latent_dim: usize,
    /// Number of alternating self/vertical layer pairs.
    pub encoder_depth: usize,
    /// Attention heads inside the latent and spatial attention blocks.
    pub num_attention_heads: usize,
    /// Width of the context side-channel concatenated into spatial q/k.
    /// Zero disables the context path.
    pub vert_c_dim: usize,
    /// Window side for the locally-grouped spatial attention.
    pub window_size: usize,
    /// Stride of the key/value subsampling in the global spatial attention.
    pub sr_ratio: usize,
    /// Accepted for config compatibility; all forwards run in eval mode.
    pub dropout: f32,
    /// Side of one tokenizer patch, in cost-map pixels.
    pub patch_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            feature_dim: 256,
            context_dim: 256,
            cost_heads_num: 1,
            cost_latent_input_dim: 64,
            cost_latent_token_num: 8,
            cost_latent_dim: 128,
            encoder_depth: 3,
            num_attention_heads: 8,
            vert_c_dim: 32,
            window_size: 7,
            sr_ratio: 4,
            dropout: 0.0,
            patch_size: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("feature_dim {feature_dim} is not divisible by cost_heads_num {heads}")]
    HeadsDontPartitionChannels { feature_dim: usize, heads: usize },
    #[error("cost_latent_dim {dim} is not divisible by num_attention_heads {heads}")]
    LatentDimNotDivisible { dim: usize, heads: usize },
    #[error("position encoding width {dim} must be divisible by 4 ({what})")]
    PositionWidthNotDivisible { dim: usize, what: &'static str },
    #[error("{what} must be non-zero")]
    ZeroField { what: &'static str },
}

impl EncoderConfig {
    /// Fail-fast structural validation, run once at encoder construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, what) in [
            (self.feature_dim, "feature_dim"),
            (self.context_dim, "context_dim"),
            (self.cost_heads_num, "cost_heads_num"),
            (self.cost_latent_input_dim, "cost_latent_input_dim"),
            (self.cost_latent_token_num, "cost_latent_token_num"),
            (self.cost_latent_dim, "cost_latent_dim"),
            (self.num_attention_heads, "num_attention_heads"),
            (self.window_size, "window_size"),
            (self.sr_ratio, "sr_ratio"),
            (self.patch_size, "patch_size"),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroField { what });
            }
        }
        if self.feature_dim % self.cost_heads_num != 0 {
            return Err(ConfigError::HeadsDontPartitionChannels {
                feature_dim: self.feature_dim,
                heads: self.cost_heads_num,
            });
        }
        if self.cost_latent_dim % self.num_attention_heads != 0 {
            return Err(ConfigError::LatentDimNotDivisible {
                dim: self.cost_latent_dim,
                heads: self.num_attention_heads,
            });
        }
        // All sinusoidal encodings split their width into 4 sin/cos groups.
        if self.cost_latent_input_dim % 4 != 0 {
            return Err(ConfigError::PositionWidthNotDivisible {
                dim: self.cost_latent_input_dim,
                what: "patch tokenizer encoding",
            });
        }
        // The subsampled-key encoding runs at the bare latent width.
        if self.cost_latent_dim % 4 != 0 {
            return Err(ConfigError::PositionWidthNotDivisible {
                dim: self.cost_latent_dim,
                what: "subsampled key encoding",
            });
        }
        if (self.cost_latent_dim + self.vert_c_dim) % 4 != 0 {
            return Err(ConfigError::PositionWidthNotDivisible {
                dim: self.cost_latent_dim + self.vert_c_dim,
                what: "spatial attention q/k encoding",
            });
        }
        Ok(())
    }

    /// Channel width of each correlation head.
    pub fn head_dim(&self) -> usize {
        self.feature_dim / self.cost_heads_num
    }

    /// Width of the patch tokens fed to the latent bottleneck.
    pub fn token_dim(&self) -> usize {
        self.cost_latent_input_dim * 2
    }
}
