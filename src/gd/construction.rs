//! Attention weights that carry out gradient descent.
//!
//! With tokens `e_i = [x_i, y_i]` and a linear self-attention block whose
//! query and key projections read `x`, whose value projection reads `y` and
//! whose output projection writes `-lr / N` into the target column, one block
//! application moves every target by
//!
//! `y_j <- y_j - lr / N * sum_i (x_j . x_i) y_i`
//!
//! which for the query token (with `y = 0`) equals minus the prediction of
//! `w` after one GD step from zero. Because the context targets turn into
//! residuals `y_i - w . x_i` as well, repeating the block continues the
//! descent, provided query tokens are hidden as keys.

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

use crate::error::ConfigError;
use crate::model::{AttentionKind, IclTransformer, TransformerConfig};

/// Check that `config` describes a model the construction applies to.
///
/// # Errors
/// Returns the first flag that breaks the construction.
pub fn check_constructible(config: &TransformerConfig) -> std::result::Result<(), ConfigError> {
    config.validate()?;

    let unsupported = |msg: &'static str| -> std::result::Result<(), ConfigError> {
        Err(ConfigError::Unsupported(msg))
    };
    if AttentionKind::from_config(config) != AttentionKind::Linear || config.first_layer_sm {
        return unsupported("gradient-descent weights need linear attention");
    }
    if !config.only_attention {
        return unsupported("gradient-descent weights need only_attention");
    }
    if config.use_layer_norm || config.use_pe || config.sum_norm {
        return unsupported("gradient-descent weights need raw tokens (no layer norm, PE or sum_norm)");
    }
    if config.input_mapping || config.input_mlp || config.output_mapping {
        return unsupported("gradient-descent weights need identity input and output");
    }
    if config.num_heads != 1 {
        return unsupported("gradient-descent weights use a single head");
    }
    if config.key_size + 1 < config.input_dim {
        return unsupported("key_size must cover every feature column");
    }
    if config.clip > 0.0 {
        return unsupported("gradient-descent weights need clip disabled");
    }
    if config.num_layers > 1 && !config.exclude_query_keys {
        return unsupported("multi-step gradient descent needs exclude_query_keys");
    }
    Ok(())
}

/// Named tensors for a model that performs one GD step per block application.
///
/// The step size is divided by `dampening` so the model follows exactly
/// `learning_rate`. `1 / N` is baked in from `in_context_length - test_points`,
/// so exact agreement holds for sequences of that length.
///
/// # Errors
/// Returns an error if the config is not constructible or tensor creation fails.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn construct_gd_weights(
    config: &TransformerConfig,
    learning_rate: f64,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    check_constructible(config)?;

    let width = config.input_dim;
    let features = width - 1;
    let key_size = config.key_size;
    let value_size = config.value_dim();
    let context = config.in_context_length - config.test_points;
    let step = -learning_rate / (context as f64 * config.dampening);

    // Query/key: (key_size, width), identity on the feature columns
    let mut qk = vec![0.0f32; key_size * width];
    for i in 0..features {
        qk[i * width + i] = 1.0;
    }
    // Value: (value_size, width), row 0 copies the target column
    let mut value = vec![0.0f32; value_size * width];
    value[features] = 1.0;
    // Output: (width, value_size), writes the scaled value into the target column
    let mut output = vec![0.0f32; width * value_size];
    output[features * value_size] = step as f32;

    let qk = Tensor::from_vec(qk, (key_size, width), device)?;
    let value = Tensor::from_vec(value, (value_size, width), device)?;
    let output = Tensor::from_vec(output, (width, value_size), device)?;

    let prefixes: Vec<String> = if config.deq {
        vec!["block".to_string()]
    } else {
        (0..config.num_layers).map(|i| format!("blocks.{i}")).collect()
    };

    let mut tensors = HashMap::new();
    for prefix in prefixes {
        let attn = format!("{prefix}.attn");
        tensors.insert(format!("{attn}.query.weight"), qk.clone());
        tensors.insert(format!("{attn}.key.weight"), qk.clone());
        tensors.insert(format!("{attn}.value.weight"), value.clone());
        tensors.insert(format!("{attn}.output.weight"), output.clone());
        if config.use_bias {
            for (name, size) in [
                ("query", key_size),
                ("key", key_size),
                ("value", value_size),
                ("output", width),
            ] {
                tensors.insert(
                    format!("{attn}.{name}.bias"),
                    Tensor::zeros(size, DType::F32, device)?,
                );
            }
        }
    }

    tracing::debug!(
        tensors = tensors.len(),
        learning_rate,
        context,
        "constructed gradient-descent weights"
    );
    Ok(tensors)
}

/// Build a transformer whose forward pass is `num_layers` steps of GD.
///
/// # Errors
/// Returns an error if the config is not constructible or model creation fails.
pub fn gd_transformer(
    config: &TransformerConfig,
    learning_rate: f64,
    device: &Device,
) -> Result<IclTransformer> {
    let tensors = construct_gd_weights(config, learning_rate, device)?;
    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    IclTransformer::new(config.clone(), vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RegressionTaskConfig;
    use crate::gd::GdLearner;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    fn task(input_size: usize, context_len: usize, seed: u64) -> crate::data::RegressionBatch {
        let cfg = RegressionTaskConfig {
            input_size,
            context_len,
            test_points: 1,
            batch_size: 8,
            ..RegressionTaskConfig::default()
        };
        cfg.sample(&mut StdRng::seed_from_u64(seed), &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_one_layer_matches_one_gd_step() {
        let device = Device::Cpu;
        let config = TransformerConfig::gd_linear(5, 16, 1);
        let model = gd_transformer(&config, 0.7, &device).unwrap();
        let batch = task(5, 16, 11);

        let ours = model.predict(&batch.tokens, false).unwrap();
        let gd = GdLearner::new(0.7, 1)
            .predict_batch(&batch.tokens, 1)
            .unwrap();
        assert!(max_abs_diff(&ours, &gd.predictions) < 1e-4);
    }

    #[test]
    fn test_tied_layers_match_several_gd_steps() {
        let device = Device::Cpu;
        let config = TransformerConfig::gd_linear(4, 12, 5);
        let model = gd_transformer(&config, 0.5, &device).unwrap();
        let batch = task(4, 12, 5);

        let ours = model.predict(&batch.tokens, false).unwrap();
        let gd = GdLearner::new(0.5, 5)
            .predict_batch(&batch.tokens, 1)
            .unwrap();
        assert!(max_abs_diff(&ours, &gd.predictions) < 1e-3);
    }

    #[test]
    fn test_stacked_bias_and_dampening_variants() {
        let device = Device::Cpu;
        let config = TransformerConfig {
            deq: false,
            use_bias: true,
            dampening: 0.5,
            y_update: true,
            key_size: 6,
            value_size: 2,
            ..TransformerConfig::gd_linear(3, 10, 3)
        };
        let model = gd_transformer(&config, 0.4, &device).unwrap();
        let batch = task(3, 10, 2);

        let ours = model.predict(&batch.tokens, false).unwrap();
        let gd = GdLearner::new(0.4, 3)
            .predict_batch(&batch.tokens, 1)
            .unwrap();
        assert!(max_abs_diff(&ours, &gd.predictions) < 1e-3);
    }

    #[test]
    fn test_rejects_incompatible_configs() {
        let device = Device::Cpu;
        let base = TransformerConfig::gd_linear(3, 10, 2);

        for config in [
            TransformerConfig {
                use_softmax: true,
                ..base.clone()
            },
            TransformerConfig {
                exclude_query_keys: false,
                ..base.clone()
            },
            TransformerConfig {
                num_heads: 2,
                ..base.clone()
            },
            TransformerConfig {
                key_size: 2,
                ..base.clone()
            },
            TransformerConfig::small(),
        ] {
            assert!(construct_gd_weights(&config, 0.1, &device).is_err());
        }
    }
}
