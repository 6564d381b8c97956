use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;

use icl_transformer::data::{RegressionBatch, RegressionTaskConfig, mse};
use icl_transformer::gd::{GdLearner, alignment, construct_gd_weights};
use icl_transformer::model::TransformerConfig;
use icl_transformer::weights::loader as weights_loader;

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

fn sample(input_size: usize, context_len: usize, seed: u64) -> Result<RegressionBatch> {
    let cfg = RegressionTaskConfig {
        input_size,
        context_len,
        batch_size: 16,
        ..RegressionTaskConfig::default()
    };
    Ok(cfg.sample(&mut StdRng::seed_from_u64(seed), &Device::Cpu)?)
}

#[test]
fn crate_boots() {
    let cfg = TransformerConfig::default();
    assert!(cfg.validate().is_ok());
}

#[test]
fn constructed_weights_survive_save_and_load() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let config = TransformerConfig::gd_linear(4, 12, 3);

    let tensors = construct_gd_weights(&config, 0.5, &device)?;
    let path = weights_loader::save_tensors(&tensors, &config, dir.path())?;
    assert!(dir.path().join(weights_loader::CONFIG_FILE).exists());

    let model = weights_loader::load_external_model(&path, &device)?;
    assert_eq!(model.config(), &config);

    let batch = sample(4, 12, 9)?;
    let ours = model.predict(&batch.tokens, false)?;
    let gd = GdLearner::new(0.5, 3).predict_batch(&batch.tokens, 1)?;
    anyhow::ensure!(max_abs_diff(&ours, &gd.predictions)? < 1e-3);
    Ok(())
}

#[test]
fn random_model_round_trips_through_varmap() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let config = TransformerConfig {
        input_dim: 5,
        in_context_length: 9,
        in_context_length_test: 9,
        ..TransformerConfig::small()
    };

    let (model, varmap) = weights_loader::init_model(config.clone(), &device)?;
    let path = weights_loader::save_varmap(&varmap, &config, dir.path())?;
    let reloaded = weights_loader::load_external_model(&path, &device)?;

    let tokens = sample(4, 8, 1)?.tokens;
    let a = model.forward(&tokens, false, false)?.output;
    let b = reloaded.forward(&tokens, false, false)?.output;
    anyhow::ensure!(max_abs_diff(&a, &b)? < 1e-6);
    Ok(())
}

#[test]
fn layout_mismatch_is_reported() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let stacked = TransformerConfig {
        deq: false,
        ..TransformerConfig::gd_linear(3, 6, 2)
    };
    let tensors = construct_gd_weights(&stacked, 0.1, &device)?;
    let path = weights_loader::save_tensors(&tensors, &stacked, dir.path())?;

    let tied = TransformerConfig::gd_linear(3, 6, 2);
    let err = weights_loader::load_model_with_config(&path, tied, &device)
        .err()
        .expect("tied config over stacked weights should error");
    assert!(
        err.chain().any(|e| e.to_string().contains("deq = true")),
        "unexpected error chain: {err:?}"
    );
    Ok(())
}

#[test]
fn invalid_config_json_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join(weights_loader::CONFIG_FILE);
    std::fs::write(&config_path, r#"{"use_softmax": true, "use_non_lin_mix": true}"#)?;

    let err = weights_loader::load_config(&config_path)
        .err()
        .expect("conflicting flags should be rejected");
    assert!(
        err.chain().any(|e| e.to_string().contains("mutually exclusive")),
        "unexpected error chain: {err:?}"
    );
    Ok(())
}

#[test]
fn missing_config_falls_back_to_default() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = weights_loader::load_config_for_model(&dir.path().join("model.safetensors"))?;
    assert_eq!(cfg, TransformerConfig::default());
    Ok(())
}

#[test]
fn more_gd_steps_fit_the_context_better() -> Result<()> {
    let device = Device::Cpu;
    let batch = sample(5, 30, 4)?;

    let mut errors = Vec::new();
    for steps in [1, 4, 16] {
        let config = TransformerConfig::gd_linear(5, 30, steps);
        let tensors = construct_gd_weights(&config, 1.0, &device)?;
        let dir = tempfile::tempdir()?;
        let path = weights_loader::save_tensors(&tensors, &config, dir.path())?;
        let model = weights_loader::load_external_model(&path, &device)?;

        let preds = model.predict(&batch.tokens, false)?;
        errors.push(mse(&preds, &batch.targets)?);

        let report = alignment(&model, &GdLearner::new(1.0, steps), &batch.tokens)?;
        anyhow::ensure!(report.prediction_gap < 1e-4, "gap {}", report.prediction_gap);
    }
    anyhow::ensure!(errors[0] > errors[1] && errors[1] > errors[2], "{errors:?}");
    Ok(())
}
