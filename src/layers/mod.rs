pub mod attention;
pub mod cross_attention;
pub mod mlp;
pub mod patch_embed;
pub mod self_attention;
pub mod spatial;
