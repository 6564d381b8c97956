//! In-context learning transformer CLI
//!
//! Inspect configurations, export gradient-descent constructed weights and
//! compare a transformer with explicit gradient descent on sampled tasks.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::SeedableRng;
use serde::Serialize;

use icl_transformer::data::{RegressionTaskConfig, TaskKind, mse};
use icl_transformer::gd::{GdLearner, alignment, construct_gd_weights, gd_transformer};
use icl_transformer::model::{IclTransformer, TransformerConfig};
use icl_transformer::telemetry;
use icl_transformer::weights::loader as weights_loader;

/// Target function family for sampled tasks.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Task {
    /// Noisy linear regression
    #[default]
    Linear,
    /// Random sinusoid of a linear projection
    Sinusoid,
}

impl From<Task> for TaskKind {
    fn from(task: Task) -> Self {
        match task {
            Task::Linear => TaskKind::Linear,
            Task::Sinusoid => TaskKind::Sinusoid,
        }
    }
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human readable text
    #[default]
    Plain,
    /// JSON object
    Json,
}

/// Transformer for studying in-context learning as gradient descent.
#[derive(Debug, Parser)]
#[command(
    name = "icl-transformer",
    version,
    about = "Configurable transformer for in-context learning experiments",
    long_about = "Builds transformers with ablation switches (layer norm, positional encodings, \
                  weight tying, softmax mixing, clipping, dampening) and compares them with \
                  explicit gradient descent on in-context regression tasks."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose output (overridden by ICL_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a configuration and its parameter count
    Info {
        /// Path to a config.json (defaults to the built-in small config)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Compare a model with gradient descent on sampled tasks
    Eval(EvalArgs),
    /// Export weights that implement gradient descent
    Construct(ConstructArgs),
}

#[derive(Debug, Args)]
struct TaskArgs {
    /// Feature dimension of x
    #[arg(long, default_value = "10")]
    input_size: usize,

    /// Labelled examples per sequence
    #[arg(long, default_value = "20")]
    context_len: usize,

    /// Standard deviation of label noise
    #[arg(long, default_value = "0.0")]
    noise: f64,

    /// Target function family
    #[arg(long, value_enum, default_value = "linear")]
    task: Task,
}

#[derive(Debug, Args)]
struct EvalArgs {
    #[command(flatten)]
    task: TaskArgs,

    /// Path to model weights; config.json is read from the same directory.
    /// Without it a gradient-descent constructed model is evaluated.
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Sequences per batch
    #[arg(long, default_value = "64")]
    batch_size: usize,

    /// Gradient-descent learning rate
    #[arg(long, default_value = "1.0")]
    lr: f64,

    /// Gradient-descent steps (also block applications of the constructed model)
    #[arg(long, default_value = "1")]
    steps: usize,

    /// Random seed for task sampling
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Output format
    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct ConstructArgs {
    #[command(flatten)]
    task: TaskArgs,

    /// Gradient-descent learning rate
    #[arg(long, default_value = "1.0")]
    lr: f64,

    /// Gradient-descent steps (block applications)
    #[arg(long, default_value = "1")]
    steps: usize,

    /// Store one block per step instead of a single shared block
    #[arg(long)]
    stacked: bool,

    /// Output directory for model.safetensors and config.json
    #[arg(short, long)]
    out: PathBuf,
}

#[derive(Debug, Serialize)]
struct EvalReport {
    model: String,
    task: String,
    batch_size: usize,
    context_len: usize,
    seed: u64,
    lr: f64,
    steps: usize,
    model_mse: f32,
    gd_mse: f32,
    prediction_gap: f32,
    sensitivity_cosine: Option<f32>,
    elapsed_ms: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);

    match cli.command {
        Command::Info { config } => print_info(config.as_deref()),
        Command::Eval(args) => run_eval(&args),
        Command::Construct(args) => run_construct(&args),
    }
}

fn print_info(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = match config_path {
        Some(path) => weights_loader::load_config(path)?,
        None => TransformerConfig::default(),
    };

    println!("ICL Transformer Config");
    println!("======================");
    println!();
    println!("  Input dim:       {}", config.input_dim);
    println!("  Model width:     {}", config.model_width());
    println!(
        "  Layers:          {} ({})",
        config.num_layers,
        if config.deq { "weight-tied" } else { "stacked" }
    );
    println!(
        "  Heads:           {} x key {} / value {}",
        config.num_heads,
        config.key_size,
        config.value_dim()
    );
    println!(
        "  Context length:  {} (test {})",
        config.in_context_length, config.in_context_length_test
    );
    println!("  Query tokens:    {}", config.test_points);
    println!("  Parameters:      {}", config.parameter_count());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn task_config(args: &TaskArgs, batch_size: usize, test_points: usize) -> RegressionTaskConfig {
    RegressionTaskConfig {
        input_size: args.input_size,
        context_len: args.context_len,
        test_points,
        batch_size,
        noise_std: args.noise,
        kind: args.task.into(),
        ..RegressionTaskConfig::default()
    }
}

fn load_eval_model(
    args: &EvalArgs,
    device: &candle_core::Device,
) -> Result<(IclTransformer, String)> {
    if let Some(model_path) = args.model.as_ref() {
        if !model_path.exists() {
            anyhow::bail!("Model file not found: {}", model_path.display());
        }
        let model = weights_loader::load_external_model(model_path, device)
            .context("Failed to load external model")?;
        return Ok((model, model_path.display().to_string()));
    }

    let config =
        TransformerConfig::gd_linear(args.task.input_size, args.task.context_len, args.steps);
    let model = gd_transformer(&config, args.lr, device)
        .context("Failed to construct gradient-descent model")?;
    Ok((model, format!("gd-constructed (lr={}, steps={})", args.lr, args.steps)))
}

fn run_eval(args: &EvalArgs) -> Result<()> {
    let device = candle_core::Device::Cpu;
    let (model, model_name) = load_eval_model(args, &device)?;

    let test_points = model.config().test_points;
    let task = task_config(&args.task, args.batch_size, test_points);
    if task.token_width() != model.config().input_dim {
        anyhow::bail!(
            "Task tokens have width {} but the model expects input_dim {}",
            task.token_width(),
            model.config().input_dim
        );
    }

    let start = Instant::now();
    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);
    let batch = task.sample(&mut rng, &device).context("sample tasks")?;

    let learner = GdLearner::new(args.lr, args.steps);
    let predictions = model.predict(&batch.tokens, false).context("model prediction")?;
    let gd = learner.predict_batch(&batch.tokens, test_points)?;
    let report = alignment(&model, &learner, &batch.tokens)?;
    let elapsed_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

    let report = EvalReport {
        model: model_name,
        task: format!("{:?}", task.kind).to_lowercase(),
        batch_size: args.batch_size,
        context_len: args.task.context_len,
        seed: args.seed,
        lr: args.lr,
        steps: args.steps,
        model_mse: mse(&predictions, &batch.targets)?,
        gd_mse: mse(&gd.predictions, &batch.targets)?,
        prediction_gap: report.prediction_gap,
        sensitivity_cosine: report.sensitivity_cosine,
        elapsed_ms,
    };
    tracing::info!(elapsed_ms, "evaluation finished");

    match args.format {
        OutputFormat::Plain => {
            println!("Model:              {}", report.model);
            println!(
                "Task:               {} ({} sequences, {} examples each)",
                report.task, report.batch_size, report.context_len
            );
            println!("Model MSE:          {:.6}", report.model_mse);
            println!(
                "GD MSE:             {:.6} (lr={}, steps={})",
                report.gd_mse, report.lr, report.steps
            );
            println!("Prediction gap:     {:.6}", report.prediction_gap);
            match report.sensitivity_cosine {
                Some(cos) => println!("Sensitivity cosine: {cos:.6}"),
                None => println!("Sensitivity cosine: n/a"),
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn run_construct(args: &ConstructArgs) -> Result<()> {
    let device = candle_core::Device::Cpu;
    let config = TransformerConfig {
        deq: !args.stacked,
        ..TransformerConfig::gd_linear(args.task.input_size, args.task.context_len, args.steps)
    };
    let tensors = construct_gd_weights(&config, args.lr, &device)
        .context("construct gradient-descent weights")?;
    let path = weights_loader::save_tensors(&tensors, &config, &args.out)?;
    println!("Wrote {} ({} tensors)", path.display(), tensors.len());
    Ok(())
}
