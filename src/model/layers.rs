//! Common neural network layers.
//!
//! MLP and the configurable transformer block.

use candle_core::{D, Result, Tensor};
use candle_nn::{Dropout, Init, LayerNorm, Linear, Module, VarBuilder};

use super::attention::{AttentionKind, KeyMask, MultiHeadAttention};
use super::config::TransformerConfig;

/// Linear layer with variance-scaled normal init and optional zero bias.
///
/// Init hints only apply to fresh `VarMap`s; loaded weights are used as is.
///
/// # Errors
/// Returns an error if weight loading fails.
#[allow(clippy::needless_pass_by_value, clippy::cast_precision_loss)]
pub fn linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    init_scale: f64,
    vb: VarBuilder,
) -> Result<Linear> {
    let stdev = (init_scale / in_dim.max(1) as f64).sqrt();
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Randn { mean: 0.0, stdev })?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Feed-forward network with GELU activation.
///
/// c_fc -> GELU -> c_proj, hidden width `widening_factor * in_dim`.
pub struct Mlp {
    /// Up projection (in_dim -> widening_factor * in_dim)
    c_fc: Linear,
    /// Down projection (hidden -> out_dim)
    c_proj: Linear,
}

impl Mlp {
    /// Create a new MLP layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        config: &TransformerConfig,
        in_dim: usize,
        out_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = config.widening_factor.max(1) * in_dim;
        let c_fc = linear(in_dim, hidden, config.use_bias, config.init_scale, vb.pp("c_fc"))?;
        let c_proj = linear(hidden, out_dim, config.use_bias, config.init_scale, vb.pp("c_proj"))?;
        Ok(Self { c_fc, c_proj })
    }

    /// Forward pass through MLP.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?;
        let h = h.gelu()?;
        self.c_proj.forward(&h)
    }
}

/// Transformer block with optional pre-norm.
///
/// Structure: [LayerNorm] -> Attention -> Residual -> [LayerNorm -> MLP -> Residual]
///
/// Each residual update is scaled by `dampening`, optionally restricted to
/// the target column (`y_update`) and followed by a clamp when `clip > 0`.
pub struct TransformerBlock {
    ln_1: Option<LayerNorm>,
    attn: MultiHeadAttention,
    ln_2: Option<LayerNorm>,
    /// Absent when the config is attention-only
    mlp: Option<Mlp>,
    dropout: Dropout,
    dampening: f64,
    clip: f64,
    y_update: bool,
}

impl TransformerBlock {
    /// Create a new transformer block.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `kind` - Attention weighting used by this block
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &TransformerConfig, kind: AttentionKind, vb: VarBuilder) -> Result<Self> {
        let width = config.model_width();
        let norm = |name: &str| -> Result<Option<LayerNorm>> {
            if config.use_layer_norm {
                let ln = candle_nn::layer_norm(
                    width,
                    candle_nn::LayerNormConfig::default(),
                    vb.pp(name),
                )?;
                Ok(Some(ln))
            } else {
                Ok(None)
            }
        };

        let ln_1 = norm("ln_1")?;
        let attn = MultiHeadAttention::new(config, kind, vb.pp("attn"))?;
        let (ln_2, mlp) = if config.only_attention {
            (None, None)
        } else {
            (norm("ln_2")?, Some(Mlp::new(config, width, width, vb.pp("mlp"))?))
        };

        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
            dropout: Dropout::new(config.dropout_rate),
            dampening: config.dampening,
            clip: config.clip,
            y_update: config.y_update,
        })
    }

    /// Attention layer of this block.
    #[must_use]
    pub fn attention(&self) -> &MultiHeadAttention {
        &self.attn
    }

    fn residual(&self, h: &Tensor, update: &Tensor) -> Result<Tensor> {
        let update = (update * self.dampening)?;

        let h = if self.y_update {
            let width = h.dim(D::Minus1)?;
            let features = h.narrow(D::Minus1, 0, width - 1)?;
            let target = (h.narrow(D::Minus1, width - 1, 1)?
                + update.narrow(D::Minus1, width - 1, 1)?)?;
            Tensor::cat(&[&features, &target], D::Minus1)?
        } else {
            (h + update)?
        };

        if self.clip > 0.0 {
            h.clamp(-self.clip, self.clip)
        } else {
            Ok(h)
        }
    }

    /// Forward pass through the transformer block.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, width)
    /// * `mask` - Optional key mask for attention
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, width) and the attention weights
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&KeyMask>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let h = match &self.ln_1 {
            Some(ln) => ln.forward(x)?,
            None => x.clone(),
        };
        let (h, weights) = self.attn.forward(&h, mask)?;
        let h = self.dropout.forward(&h, train)?;
        let mut x = self.residual(x, &h)?;

        if let Some(mlp) = &self.mlp {
            let h = match &self.ln_2 {
                Some(ln) => ln.forward(&x)?,
                None => x.clone(),
            };
            let h = mlp.forward(&h)?;
            let h = self.dropout.forward(&h, train)?;
            x = self.residual(&x, &h)?;
        }

        Ok((x, weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn block(config: &TransformerConfig) -> TransformerBlock {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TransformerBlock::new(config, AttentionKind::from_config(config), vb).unwrap()
    }

    fn max_abs(t: &Tensor) -> f32 {
        t.abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn test_block_preserves_shape() {
        let config = TransformerConfig {
            only_attention: false,
            use_layer_norm: true,
            ..TransformerConfig::gd_linear(3, 5, 1)
        };
        let x = Tensor::randn(0f32, 1.0, (2, 6, 4), &Device::Cpu).unwrap();
        let (y, w) = block(&config).forward(&x, None, false).unwrap();
        assert_eq!(y.dims(), &[2, 6, 4]);
        assert_eq!(w.dims(), &[2, 1, 6, 6]);
    }

    #[test]
    fn test_y_update_leaves_features_untouched() {
        let config = TransformerConfig {
            y_update: true,
            only_attention: false,
            init_scale: 1.0,
            ..TransformerConfig::gd_linear(3, 5, 1)
        };
        let x = Tensor::randn(0f32, 1.0, (1, 6, 4), &Device::Cpu).unwrap();
        let (y, _) = block(&config).forward(&x, None, false).unwrap();

        let before = x.narrow(2, 0, 3).unwrap();
        let after = y.narrow(2, 0, 3).unwrap();
        assert!(max_abs(&(after - before).unwrap()) < 1e-7);
    }

    #[test]
    fn test_clip_bounds_stream() {
        let config = TransformerConfig {
            clip: 0.25,
            ..TransformerConfig::gd_linear(3, 5, 1)
        };
        let x = (Tensor::randn(0f32, 1.0, (1, 6, 4), &Device::Cpu).unwrap() * 10.0).unwrap();
        let (y, _) = block(&config).forward(&x, None, false).unwrap();
        assert!(max_abs(&y) <= 0.25 + 1e-7);
    }

    #[test]
    fn test_dampening_scales_update() {
        let full = TransformerConfig {
            init_scale: 1.0,
            ..TransformerConfig::gd_linear(3, 5, 1)
        };
        let half = TransformerConfig {
            dampening: 0.5,
            ..full.clone()
        };

        let varmap = VarMap::new();
        let x = Tensor::randn(0f32, 1.0, (1, 6, 4), &Device::Cpu).unwrap();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let a = TransformerBlock::new(&full, AttentionKind::Linear, vb).unwrap();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let b = TransformerBlock::new(&half, AttentionKind::Linear, vb).unwrap();

        let (ya, _) = a.forward(&x, None, false).unwrap();
        let (yb, _) = b.forward(&x, None, false).unwrap();
        let da = (ya - &x).unwrap();
        let db = ((yb - &x).unwrap() * 2.0).unwrap();
        assert!(max_abs(&(da - db).unwrap()) < 1e-4);
    }

    #[test]
    fn test_dropout_only_when_training() {
        let config = TransformerConfig {
            dropout_rate: 0.5,
            init_scale: 1.0,
            ..TransformerConfig::gd_linear(3, 5, 1)
        };
        let block = block(&config);
        let x = Tensor::randn(0f32, 1.0, (2, 6, 4), &Device::Cpu).unwrap();

        let (eval_a, _) = block.forward(&x, None, false).unwrap();
        let (eval_b, _) = block.forward(&x, None, false).unwrap();
        assert_eq!(max_abs(&(&eval_a - &eval_b).unwrap()), 0.0);

        let (trained, _) = block.forward(&x, None, true).unwrap();
        assert!(max_abs(&(trained - eval_a).unwrap()) > 1e-6);
    }
}
