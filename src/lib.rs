//! Cost-volume transformer encoder for dense optical flow.
//!
//! Given two per-image feature maps, the encoder builds the all-pairs
//! correlation (cost) volume between them, tokenizes each per-pixel cost map
//! into a coarse grid of position-encoded patch tokens, and compresses the
//! result into a fixed number of latent tokens with an alternating
//! latent-self-attention / windowed-spatial-attention stack. The latent
//! tokens, the raw cost maps, and the coarse token-grid size are handed to an
//! external flow decoder.
//!
//! The feature backbone, the context encoder, and the flow decoder are
//! external collaborators; this crate only consumes and produces dense
//! tensors at those boundaries.

pub mod config;
pub mod corr;
pub mod encoder;
pub mod layers;
pub mod ops;
pub mod position;

pub use config::{ConfigError, EncoderConfig};
pub use encoder::{CostMemory, CostPerceiverEncoder, MemoryEncoder};
