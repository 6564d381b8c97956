use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use safetensors::SafeTensors;

use crate::model::{IclTransformer, TransformerConfig, load_model_from_bytes};

/// File name of the weights inside an export directory.
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// File name of the config inside an export directory.
pub const CONFIG_FILE: &str = "config.json";

/// Build a freshly initialized model together with the `VarMap` holding its
/// parameters.
///
/// # Errors
/// Returns an error if the config is invalid or initialization fails.
pub fn init_model(config: TransformerConfig, device: &Device) -> Result<(IclTransformer, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = IclTransformer::new(config, vb).context("initialize model")?;
    tracing::debug!(variables = varmap.all_vars().len(), "initialized model");
    Ok((model, varmap))
}

/// Load a model from a weights file on disk, reading `config.json` from the same directory when
/// available.
///
/// # Errors
/// Returns an error if the weights or config cannot be loaded.
pub fn load_external_model(model_path: &Path, device: &Device) -> Result<IclTransformer> {
    let config = load_config_for_model(model_path)?;
    load_model_with_config(model_path, config, device)
}

/// Load a model from a weights file with an explicit config.
///
/// # Errors
/// Returns an error if the file cannot be read, its tensors do not match the
/// config's layout, or model construction fails.
pub fn load_model_with_config(
    model_path: &Path,
    config: TransformerConfig,
    device: &Device,
) -> Result<IclTransformer> {
    let data = std::fs::read(model_path)
        .with_context(|| format!("read weights {}", model_path.display()))?;
    let safetensors = SafeTensors::deserialize(&data)
        .with_context(|| format!("parse safetensors {}", model_path.display()))?;
    check_layout(&safetensors, &config)?;

    tracing::info!(
        path = %model_path.display(),
        tensors = safetensors.len(),
        layers = config.num_layers,
        deq = config.deq,
        "loading model"
    );
    load_model_from_bytes(&data, config, device).context("load weights")
}

/// Config stored next to a weights file, or the default config when there is none.
///
/// # Errors
/// Returns an error if `config.json` exists but cannot be read, parsed or validated.
pub fn load_config_for_model(model_path: &Path) -> Result<TransformerConfig> {
    let Some(parent) = model_path.parent() else {
        return Ok(TransformerConfig::default());
    };

    let config_path = parent.join(CONFIG_FILE);
    if !config_path.exists() {
        tracing::warn!(
            path = %config_path.display(),
            "no config.json next to weights, using default config"
        );
        return Ok(TransformerConfig::default());
    }
    load_config(&config_path)
}

/// Read and validate a config file.
///
/// # Errors
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config(config_path: &Path) -> Result<TransformerConfig> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let cfg: TransformerConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", config_path.display()))?;
    cfg.validate().context("invalid TransformerConfig")?;
    Ok(cfg)
}

/// Weight-tied checkpoints store `block.*`, stacked ones `blocks.{i}.*`.
fn check_layout(st: &SafeTensors<'_>, config: &TransformerConfig) -> Result<()> {
    let names = st.names();
    let tied = names.iter().any(|n| n.starts_with("block."));
    let stacked = names.iter().any(|n| n.starts_with("blocks."));

    if config.deq && !tied && stacked {
        anyhow::bail!("config has deq = true but the weights hold per-layer blocks (blocks.*)");
    }
    if !config.deq && tied && !stacked {
        anyhow::bail!("config has deq = false but the weights hold one shared block (block.*)");
    }
    Ok(())
}

fn write_config(config: &TransformerConfig, dir: &Path) -> Result<()> {
    let config_path = dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(config).context("serialize config")?;
    std::fs::write(&config_path, json)
        .with_context(|| format!("write {}", config_path.display()))
}

/// Write named tensors and their config into `dir`.
///
/// # Returns
/// Path of the written weights file
///
/// # Errors
/// Returns an error if the directory or files cannot be written.
pub fn save_tensors(
    tensors: &HashMap<String, Tensor>,
    config: &TransformerConfig,
    dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let weights_path = dir.join(WEIGHTS_FILE);
    candle_core::safetensors::save(tensors, &weights_path)
        .with_context(|| format!("write {}", weights_path.display()))?;
    write_config(config, dir)?;
    tracing::info!(path = %weights_path.display(), tensors = tensors.len(), "saved model");
    Ok(weights_path)
}

/// Write the parameters of a `VarMap` and their config into `dir`.
///
/// # Errors
/// Returns an error if the directory or files cannot be written.
pub fn save_varmap(varmap: &VarMap, config: &TransformerConfig, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let weights_path = dir.join(WEIGHTS_FILE);
    varmap
        .save(&weights_path)
        .with_context(|| format!("write {}", weights_path.display()))?;
    write_config(config, dir)?;
    tracing::info!(path = %weights_path.display(), "saved model");
    Ok(weights_path)
}
