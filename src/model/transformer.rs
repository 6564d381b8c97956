//! In-context learning transformer.
//!
//! Composes input mapping, an optional input MLP, positional encoding,
//! stacked or weight-tied blocks and an optional output mapping.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use super::attention::{AttentionKind, KeyMask};
use super::config::TransformerConfig;
use super::layers::{Mlp, TransformerBlock, linear};
use super::positional::PositionalEncoding;

/// Everything a forward pass produces.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Final stream (or output mapping) of shape (batch, seq_len, width)
    pub output: Tensor,
    /// Input to every block application, followed by the final stream
    pub hidden_states: Vec<Tensor>,
    /// Attention weights per block application, (batch, heads, seq_len, seq_len)
    pub attention_maps: Vec<Tensor>,
}

enum Depth {
    /// One block applied `num_layers` times
    Tied(TransformerBlock),
    /// One block per layer
    Stacked(Vec<TransformerBlock>),
}

/// Configurable transformer over sequences of `[x, y]` tokens.
///
/// Features:
/// - Linear, softmax or gated-mix attention, optionally softmax in layer 0 only
/// - Weight-tied (DEQ-style) or stacked depth
/// - Additive, concatenated, flipped or zeroed sinusoidal positions
/// - Residual dampening, clipping and target-only updates
pub struct IclTransformer {
    input_mapping: Option<Linear>,
    input_mlp: Option<Mlp>,
    pos_encoding: Option<PositionalEncoding>,
    depth: Depth,
    output_mapping: Option<Linear>,
    config: TransformerConfig,
    device: Device,
}

impl IclTransformer {
    /// Create a new model by loading (or initializing) weights.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if the config is invalid or weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: TransformerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let device = vb.device().clone();
        let bias = config.use_bias;
        let scale = config.init_scale;

        let input_mapping = if config.input_mapping {
            Some(linear(
                config.input_dim,
                config.embedding_size,
                bias,
                scale,
                vb.pp("input_mapping"),
            )?)
        } else {
            None
        };
        let base = if config.input_mapping {
            config.embedding_size
        } else {
            config.input_dim
        };

        let input_mlp = if config.input_mlp {
            Some(Mlp::new(
                &config,
                base - 1,
                config.input_mlp_features(base),
                vb.pp("input_mlp"),
            )?)
        } else {
            None
        };

        let pos_encoding = if config.use_pe {
            Some(PositionalEncoding::new(&config, &device)?)
        } else {
            None
        };

        let kind = AttentionKind::from_config(&config);
        let depth = if config.deq {
            Depth::Tied(TransformerBlock::new(&config, kind, vb.pp("block"))?)
        } else {
            let mut blocks = Vec::with_capacity(config.num_layers);
            for i in 0..config.num_layers {
                let kind = if i == 0 && config.first_layer_sm {
                    AttentionKind::Softmax
                } else {
                    kind
                };
                blocks.push(TransformerBlock::new(&config, kind, vb.pp(format!("blocks.{i}")))?);
            }
            Depth::Stacked(blocks)
        };

        let output_mapping = if config.output_mapping {
            Some(linear(
                config.model_width(),
                config.output_size,
                bias,
                scale,
                vb.pp("output_mapping"),
            )?)
        } else {
            None
        };

        Ok(Self {
            input_mapping,
            input_mlp,
            pos_encoding,
            depth,
            output_mapping,
            config,
            device,
        })
    }

    /// Block used for layer `index`.
    fn block(&self, index: usize) -> &TransformerBlock {
        match &self.depth {
            Depth::Tied(block) => block,
            Depth::Stacked(blocks) => &blocks[index],
        }
    }

    /// Replace the feature columns by learned features, keeping the target last.
    fn apply_input_mlp(&self, mlp: &Mlp, h: &Tensor) -> Result<Tensor> {
        let width = h.dim(D::Minus1)?;
        let features = h.narrow(D::Minus1, 0, width - 1)?;
        let target = h.narrow(D::Minus1, width - 1, 1)?;
        let mapped = mlp.forward(&features)?;
        let mapped = if self.config.input_mlp_out_dim == 0 {
            (features + mapped)?
        } else {
            mapped
        };
        Tensor::cat(&[&mapped, &target], D::Minus1)
    }

    /// Forward pass through the model.
    ///
    /// # Arguments
    /// * `x` - Tokens of shape (batch, seq_len, input_dim)
    /// * `predict_test` - Use the test-length positional table
    /// * `train` - Enables dropout
    ///
    /// # Errors
    /// Returns an error if shapes do not match the config or tensor ops fail.
    pub fn forward(&self, x: &Tensor, predict_test: bool, train: bool) -> Result<ForwardOutput> {
        let (_, t, width) = x.dims3()?;

        if width != self.config.input_dim {
            return Err(candle_core::Error::Msg(format!(
                "Token width {width} does not match input_dim {}",
                self.config.input_dim
            )));
        }
        let limit = if predict_test {
            self.config.in_context_length_test
        } else {
            self.config.in_context_length
        };
        if t > limit {
            return Err(candle_core::Error::Msg(format!(
                "Sequence length {t} exceeds context length {limit}"
            )));
        }
        // Masking every query as a key leaves no attendable token otherwise.
        if self.config.exclude_query_keys && t <= self.config.test_points {
            return Err(candle_core::Error::Msg(format!(
                "Sequence length {t} leaves no context for {} query tokens",
                self.config.test_points
            )));
        }

        let mut h = match &self.input_mapping {
            Some(mapping) => mapping.forward(x)?,
            None => x.clone(),
        };
        if let Some(mlp) = &self.input_mlp {
            h = self.apply_input_mlp(mlp, &h)?;
        }
        if let Some(pe) = &self.pos_encoding {
            h = pe.forward(&h, predict_test)?;
        }

        let mask = if self.config.exclude_query_keys {
            Some(KeyMask::exclude_queries(
                t,
                self.config.test_points,
                &self.device,
            )?)
        } else {
            None
        };

        let mut hidden_states = Vec::with_capacity(self.config.num_layers + 1);
        let mut attention_maps = Vec::with_capacity(self.config.num_layers);
        for layer in 0..self.config.num_layers {
            hidden_states.push(h.clone());
            let (next, weights) = self.block(layer).forward(&h, mask.as_ref(), train)?;
            attention_maps.push(weights);
            h = next;
        }
        hidden_states.push(h.clone());

        let output = match &self.output_mapping {
            Some(mapping) => mapping.forward(&h)?,
            None => h,
        };

        Ok(ForwardOutput {
            output,
            hidden_states,
            attention_maps,
        })
    }

    /// Predictions for the trailing query tokens.
    ///
    /// Without an output mapping the prediction is the negated target column
    /// of the final stream; with one it is the first output column.
    ///
    /// # Returns
    /// Tensor of shape (batch, test_points)
    ///
    /// # Errors
    /// Returns an error if the sequence holds no context tokens or the
    /// forward pass fails.
    pub fn predict(&self, x: &Tensor, predict_test: bool) -> Result<Tensor> {
        let (_, t, _) = x.dims3()?;
        let test_points = self.config.test_points;
        if t <= test_points {
            return Err(candle_core::Error::Msg(format!(
                "Sequence length {t} leaves no context for {test_points} query tokens"
            )));
        }

        let out = self.forward(x, predict_test, false)?.output;
        let queries = out.narrow(1, t - test_points, test_points)?;
        if self.output_mapping.is_some() {
            queries.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)
        } else {
            let width = queries.dim(D::Minus1)?;
            queries.narrow(D::Minus1, width - 1, 1)?.squeeze(D::Minus1)?.neg()
        }
    }

    /// Get the model configuration.
    #[must_use]
    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Get the device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Attention kind of each distinct block.
    #[must_use]
    pub fn attention_kinds(&self) -> Vec<AttentionKind> {
        match &self.depth {
            Depth::Tied(block) => vec![block.attention().kind()],
            Depth::Stacked(blocks) => blocks.iter().map(|b| b.attention().kind()).collect(),
        }
    }
}

/// Load a model from in-memory safetensors bytes.
///
/// # Errors
/// Returns an error if the buffer cannot be parsed as safetensors or model construction fails.
pub fn load_model_from_bytes(
    data: &[u8],
    config: TransformerConfig,
    device: &Device,
) -> Result<IclTransformer> {
    let vb = VarBuilder::from_buffered_safetensors(data.to_vec(), DType::F32, device)?;
    IclTransformer::new(config, vb)
}
