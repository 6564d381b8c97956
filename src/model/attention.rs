//! Multi-head self-attention with linear, softmax and mixed weighting.
//!
//! Linear attention uses the raw query-key products as weights, which is the
//! form in which one attention layer can carry out a gradient-descent step.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

use super::config::TransformerConfig;
use super::layers::linear;

/// How attention logits become attention weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    /// Weights are the raw logits `Q K^T`
    Linear,
    /// `softmax(Q K^T / sqrt(key_size))`
    Softmax,
    /// `g * softmax(Q K^T) + (1 - g) * Q K^T` with a learned gate `g`
    NonLinMix,
}

impl AttentionKind {
    /// Kind selected by the config flags for a regular (non first-layer) block.
    #[must_use]
    pub fn from_config(config: &TransformerConfig) -> Self {
        if config.use_softmax {
            Self::Softmax
        } else if config.use_non_lin_mix {
            Self::NonLinMix
        } else {
            Self::Linear
        }
    }
}

/// Key mask in the two forms the weighting variants need.
pub struct KeyMask {
    /// 1 where the key is visible, 0 otherwise; shape (1, 1, T, T)
    keep: Tensor,
    /// 0 where the key is visible, -inf otherwise; shape (1, 1, T, T)
    bias: Tensor,
}

impl KeyMask {
    /// Mask hiding the trailing `test_points` tokens as keys from every query.
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn exclude_queries(seq_len: usize, test_points: usize, device: &Device) -> Result<Self> {
        let first_query = seq_len.saturating_sub(test_points);
        let mut keep = Vec::with_capacity(seq_len * seq_len);
        let mut bias = Vec::with_capacity(seq_len * seq_len);

        for _ in 0..seq_len {
            for j in 0..seq_len {
                if j < first_query {
                    keep.push(1.0f32);
                    bias.push(0.0f32);
                } else {
                    keep.push(0.0);
                    bias.push(f32::NEG_INFINITY);
                }
            }
        }

        let keep = Tensor::from_vec(keep, (1, 1, seq_len, seq_len), device)?;
        let bias = Tensor::from_vec(bias, (1, 1, seq_len, seq_len), device)?;
        Ok(Self { keep, bias })
    }

    fn cast(&self, dtype: DType) -> Result<(Tensor, Tensor)> {
        Ok((self.keep.to_dtype(dtype)?, self.bias.to_dtype(dtype)?))
    }
}

/// Multi-head self-attention.
///
/// Separate query, key and value projections, matching the parameter layout
/// expected by the gradient-descent weight construction.
pub struct MultiHeadAttention {
    /// Query projection (width -> num_heads * key_size)
    query: Linear,
    /// Key projection (width -> num_heads * key_size)
    key: Linear,
    /// Value projection (width -> num_heads * value_size)
    value: Linear,
    /// Output projection (num_heads * value_size -> width)
    output: Linear,
    /// Gate parameter, present only for `NonLinMix`
    mix: Option<Tensor>,
    kind: AttentionKind,
    sum_norm: bool,
    num_heads: usize,
    key_size: usize,
    value_size: usize,
}

impl MultiHeadAttention {
    /// Create a new attention layer.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `kind` - Weighting variant for this layer
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &TransformerConfig, kind: AttentionKind, vb: VarBuilder) -> Result<Self> {
        let width = config.model_width();
        let num_heads = config.num_heads;
        let key_size = config.key_size;
        let value_size = config.value_dim();
        let bias = config.use_bias;
        let scale = config.init_scale;

        let query = linear(width, num_heads * key_size, bias, scale, vb.pp("query"))?;
        let key = linear(width, num_heads * key_size, bias, scale, vb.pp("key"))?;
        let value = linear(width, num_heads * value_size, bias, scale, vb.pp("value"))?;
        let output = linear(num_heads * value_size, width, bias, scale, vb.pp("output"))?;

        let mix = match kind {
            AttentionKind::NonLinMix => {
                Some(vb.get_with_hints(1, "non_lin_mix", Init::Const(0.0))?)
            }
            AttentionKind::Linear | AttentionKind::Softmax => None,
        };

        Ok(Self {
            query,
            key,
            value,
            output,
            mix,
            kind,
            sum_norm: config.sum_norm,
            num_heads,
            key_size,
            value_size,
        })
    }

    /// Weighting variant of this layer.
    #[must_use]
    pub fn kind(&self) -> AttentionKind {
        self.kind
    }

    fn heads(&self, x: &Tensor, proj: &Linear, size: usize) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        proj.forward(x)?
            .reshape((b, t, self.num_heads, size))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass for self-attention.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, width)
    /// * `mask` - Optional key mask
    ///
    /// # Returns
    /// Output of shape (batch, seq_len, width) and attention weights of shape
    /// (batch, num_heads, seq_len, seq_len)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, mask: Option<&KeyMask>) -> Result<(Tensor, Tensor)> {
        let (b, t, _) = x.dims3()?;

        let mut q = self.heads(x, &self.query, self.key_size)?;
        let mut k = self.heads(x, &self.key, self.key_size)?;
        let v = self.heads(x, &self.value, self.value_size)?;

        if self.sum_norm {
            q = q.broadcast_div(&(q.sum_keepdim(D::Minus1)? + 1e-6)?)?;
            k = k.broadcast_div(&(k.sum_keepdim(D::Minus1)? + 1e-6)?)?;
        }

        // (B, H, T, K) @ (B, H, K, T) -> (B, H, T, T)
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let logits = q.matmul(&k_t)?;

        let mask = mask.map(|m| m.cast(logits.dtype())).transpose()?;

        let weights = match self.kind {
            AttentionKind::Linear => match &mask {
                Some((keep, _)) => logits.broadcast_mul(keep)?,
                None => logits,
            },
            AttentionKind::Softmax => {
                #[allow(clippy::cast_precision_loss)]
                let scale = 1.0 / (self.key_size as f64).sqrt();
                let scaled = (logits * scale)?;
                let scaled = match &mask {
                    Some((_, bias)) => scaled.broadcast_add(bias)?,
                    None => scaled,
                };
                candle_nn::ops::softmax(&scaled, D::Minus1)?
            }
            AttentionKind::NonLinMix => {
                let (soft_in, linear) = match &mask {
                    Some((keep, bias)) => {
                        (logits.broadcast_add(bias)?, logits.broadcast_mul(keep)?)
                    }
                    None => (logits.clone(), logits),
                };
                let soft = candle_nn::ops::softmax(&soft_in, D::Minus1)?;
                let theta = self
                    .mix
                    .as_ref()
                    .ok_or_else(|| candle_core::Error::Msg("missing non_lin_mix gate".into()))?;
                let gate = candle_nn::ops::sigmoid(&(theta * 10.0)?)?;
                let rest = gate.affine(-1.0, 1.0)?;
                (soft.broadcast_mul(&gate)? + linear.broadcast_mul(&rest)?)?
            }
        };

        // (B, H, T, T) @ (B, H, T, V) -> (B, H, T, V)
        let y = weights.matmul(&v)?;
        let y = y
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.value_size))?;

        Ok((self.output.forward(&y)?, weights))
    }
}
