use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Architecture and ablation switches for [`IclTransformer`](super::IclTransformer).
///
/// Every field has a default so partial `config.json` files deserialize.
/// Tokens are laid out as `[features..., target]`, so the last column of the
/// residual stream is the target channel that the readout and `y_update`
/// act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    /// Raw token width, including the trailing target column
    pub input_dim: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Query/key dimension per head
    pub key_size: usize,
    /// Value dimension per head (0 means same as `key_size`)
    pub value_size: usize,
    /// MLP hidden width multiplier
    pub widening_factor: usize,
    /// Number of block applications
    pub num_layers: usize,
    /// Width after the input mapping
    pub embedding_size: usize,
    /// Width of the output mapping
    pub output_size: usize,
    /// Sequence length (context + queries) used for training inputs
    pub in_context_length: usize,
    /// Sequence length used when `predict_test` is set
    pub in_context_length_test: usize,
    /// Number of trailing query tokens
    pub test_points: usize,
    pub dropout_rate: f32,
    /// Skip the MLP sublayers entirely
    pub only_attention: bool,
    pub use_layer_norm: bool,
    pub use_pe: bool,
    pub pe_size: usize,
    /// Concatenate PE to the features instead of adding it
    pub concat_pe: bool,
    /// Reverse the row order of the PE table
    pub flip_pe: bool,
    /// Replace the PE values by zeros (the width is kept)
    pub zero_embeddings: bool,
    pub input_mapping: bool,
    pub output_mapping: bool,
    /// Biases on every linear projection
    pub use_bias: bool,
    /// Weight-tied depth: one block applied `num_layers` times
    pub deq: bool,
    pub init_scale: f64,
    pub use_softmax: bool,
    /// Learned sigmoid gate between softmax and linear attention
    pub use_non_lin_mix: bool,
    /// Use softmax attention in the first block only
    pub first_layer_sm: bool,
    /// Normalize query and key heads by their sum
    pub sum_norm: bool,
    /// Only the target column receives residual updates
    pub y_update: bool,
    pub input_mlp: bool,
    /// Feature width of the input MLP (0 keeps the feature width)
    pub input_mlp_out_dim: usize,
    /// Scale applied to every sublayer update
    pub dampening: f64,
    /// Residual clamp bound, disabled when 0
    pub clip: f64,
    /// Query tokens are never attended to as keys
    pub exclude_query_keys: bool,
}

impl TransformerConfig {
    /// Width of the token stream after input mapping and input MLP.
    #[must_use]
    pub fn embedding_width(&self) -> usize {
        let base = if self.input_mapping {
            self.embedding_size
        } else {
            self.input_dim
        };
        if self.input_mlp {
            self.input_mlp_features(base) + 1
        } else {
            base
        }
    }

    /// Feature columns produced by the input MLP for a stream of width `base`.
    #[must_use]
    pub fn input_mlp_features(&self, base: usize) -> usize {
        if self.input_mlp_out_dim == 0 {
            base.saturating_sub(1)
        } else {
            self.input_mlp_out_dim
        }
    }

    /// Width of the residual stream seen by the blocks.
    #[must_use]
    pub fn model_width(&self) -> usize {
        let width = self.embedding_width();
        if self.use_pe && self.concat_pe {
            width + self.pe_size
        } else {
            width
        }
    }

    /// Effective value dimension per head.
    #[must_use]
    pub fn value_dim(&self) -> usize {
        if self.value_size == 0 {
            self.key_size
        } else {
            self.value_size
        }
    }

    /// Number of scalar parameters a model built from this config holds.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        let bias = usize::from(self.use_bias);
        let linear = |i: usize, o: usize| i * o + bias * o;
        let wf = self.widening_factor.max(1);

        let mut total = 0;
        let base = if self.input_mapping {
            total += linear(self.input_dim, self.embedding_size);
            self.embedding_size
        } else {
            self.input_dim
        };
        if self.input_mlp {
            let inputs = base.saturating_sub(1);
            let hidden = wf * inputs;
            total += linear(inputs, hidden) + linear(hidden, self.input_mlp_features(base));
        }

        let w = self.model_width();
        let (h, k, v) = (self.num_heads, self.key_size, self.value_dim());
        let block = |gated: bool| {
            let mut n = 2 * linear(w, h * k) + linear(w, h * v) + linear(h * v, w);
            if gated {
                n += 1;
            }
            if self.use_layer_norm {
                n += 2 * w;
            }
            if !self.only_attention {
                if self.use_layer_norm {
                    n += 2 * w;
                }
                n += linear(w, wf * w) + linear(wf * w, w);
            }
            n
        };
        let gated = self.use_non_lin_mix && !self.use_softmax;
        total += if self.deq {
            block(gated)
        } else if self.first_layer_sm {
            block(false) + self.num_layers.saturating_sub(1) * block(gated)
        } else {
            self.num_layers * block(gated)
        };

        if self.output_mapping {
            total += linear(w, self.output_size);
        }
        total
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("input_dim", self.input_dim),
            ("num_heads", self.num_heads),
            ("key_size", self.key_size),
            ("num_layers", self.num_layers),
            ("in_context_length", self.in_context_length),
            ("in_context_length_test", self.in_context_length_test),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if self.input_mapping && self.embedding_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "embedding_size",
            });
        }
        if self.output_mapping && self.output_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "output_size",
            });
        }
        if !self.only_attention && self.widening_factor == 0 {
            return Err(ConfigError::NotPositive {
                field: "widening_factor",
            });
        }
        if self.use_pe {
            if self.pe_size == 0 || self.pe_size % 2 == 1 {
                return Err(ConfigError::OddPeSize(self.pe_size));
            }
            if !self.concat_pe && self.pe_size != self.embedding_width() {
                return Err(ConfigError::PeWidthMismatch {
                    pe_size: self.pe_size,
                    width: self.embedding_width(),
                });
            }
        }
        let context = self.in_context_length.min(self.in_context_length_test);
        if self.test_points >= context {
            return Err(ConfigError::TooManyTestPoints {
                test_points: self.test_points,
                context,
            });
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ConfigError::DropoutOutOfRange(self.dropout_rate));
        }
        if self.clip < 0.0 {
            return Err(ConfigError::NegativeClip(self.clip));
        }
        if self.dampening <= 0.0 {
            return Err(ConfigError::NotPositive { field: "dampening" });
        }
        if self.use_softmax && self.use_non_lin_mix {
            return Err(ConfigError::Conflicting("use_softmax and use_non_lin_mix"));
        }
        if self.deq && self.first_layer_sm {
            return Err(ConfigError::Conflicting("deq and first_layer_sm"));
        }
        if self.y_update && self.model_width() < 2 {
            return Err(ConfigError::Unsupported(
                "y_update needs a feature column besides the target column",
            ));
        }
        if self.input_mlp && self.embedding_width() < 2 {
            return Err(ConfigError::Unsupported(
                "input_mlp needs at least one feature column",
            ));
        }
        Ok(())
    }

    /// Linear self-attention setting in which a block can implement one step
    /// of gradient descent on an in-context linear regression problem.
    ///
    /// `input_size` features, `context_len` examples, one query, and `steps`
    /// weight-tied block applications.
    #[must_use]
    pub fn gd_linear(input_size: usize, context_len: usize, steps: usize) -> Self {
        Self {
            input_dim: input_size + 1,
            num_heads: 1,
            key_size: input_size,
            value_size: 1,
            num_layers: steps,
            in_context_length: context_len + 1,
            in_context_length_test: context_len + 1,
            test_points: 1,
            only_attention: true,
            use_layer_norm: false,
            use_pe: false,
            pe_size: 0,
            input_mapping: false,
            output_mapping: false,
            use_bias: false,
            deq: true,
            use_softmax: false,
            exclude_query_keys: true,
            ..Self::small()
        }
    }

    /// Small trainable config with mapped inputs, additive PE and full blocks.
    #[must_use]
    pub fn small() -> Self {
        Self {
            input_dim: 11,
            num_heads: 2,
            key_size: 32,
            value_size: 0,
            widening_factor: 4,
            num_layers: 3,
            embedding_size: 64,
            output_size: 1,
            in_context_length: 21,
            in_context_length_test: 21,
            test_points: 1,
            dropout_rate: 0.0,
            only_attention: false,
            use_layer_norm: true,
            use_pe: true,
            pe_size: 64,
            concat_pe: false,
            flip_pe: false,
            zero_embeddings: false,
            input_mapping: true,
            output_mapping: true,
            use_bias: true,
            deq: false,
            init_scale: 0.02,
            use_softmax: true,
            use_non_lin_mix: false,
            first_layer_sm: false,
            sum_norm: false,
            y_update: false,
            input_mlp: false,
            input_mlp_out_dim: 0,
            dampening: 1.0,
            clip: 0.0,
            exclude_query_keys: false,
        }
    }
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self::small()
    }
}
