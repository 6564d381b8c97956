pub mod attention;
pub mod config;
pub mod layers;
pub mod positional;
pub mod transformer;

// Re-exports for convenience
pub use attention::{AttentionKind, KeyMask, MultiHeadAttention};
pub use config::TransformerConfig;
pub use layers::{Mlp, TransformerBlock};
pub use positional::{PositionalEncoding, sinusoidal_table};
pub use transformer::{ForwardOutput, IclTransformer, load_model_from_bytes};
