//! Comparing a transformer with an explicit gradient-descent learner.
//!
//! Two views: how close the query predictions are, and how well the
//! model's input sensitivity `d prediction / d x_query` lines up with the
//! weight vector GD learned. For a linear model the latter is exactly `w`.

use anyhow::{Context, Result};
use candle_core::{D, Tensor, Var};
use serde::Serialize;

use super::learner::GdLearner;
use crate::data::mse;
use crate::model::IclTransformer;

/// Agreement between a model and a GD learner on one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlignmentReport {
    /// Mean squared difference between model and GD predictions
    pub prediction_gap: f32,
    /// Mean cosine similarity between model sensitivities and GD weights;
    /// `None` when the model cannot be differentiated
    pub sensitivity_cosine: Option<f32>,
}

/// Gradient of the first query prediction w.r.t. the first query's features.
///
/// # Returns
/// Tensor of shape (batch, input_dim - 1)
///
/// # Errors
/// Returns an error if the forward or backward pass fails.
pub fn query_sensitivity(model: &IclTransformer, tokens: &Tensor) -> Result<Tensor> {
    let (_, t, width) = tokens.dims3()?;
    let test_points = model.config().test_points;

    let input = Var::from_tensor(tokens)?;
    let predictions = model.predict(input.as_tensor(), false)?;
    let objective = predictions.narrow(1, 0, 1)?.sum_all()?;
    let grads = objective.backward().context("backward through model")?;
    let grad = grads
        .get(input.as_tensor())
        .context("no gradient reached the input tokens")?;

    let query = grad.narrow(1, t - test_points, 1)?.squeeze(1)?;
    Ok(query.narrow(D::Minus1, 0, width - 1)?)
}

/// Row-wise cosine similarity of two (batch, dim) tensors, averaged.
///
/// # Errors
/// Returns an error if shapes differ or tensor operations fail.
pub fn mean_cosine(a: &Tensor, b: &Tensor) -> Result<f32> {
    let dot = (a * b)?.sum(D::Minus1)?;
    let norm_a = a.sqr()?.sum(D::Minus1)?.sqrt()?;
    let norm_b = b.sqr()?.sum(D::Minus1)?.sqrt()?;
    let denom = ((norm_a * norm_b)? + 1e-12)?;
    Ok((dot / denom)?.mean_all()?.to_scalar::<f32>()?)
}

/// Compare `model` and `learner` on a token batch.
///
/// # Errors
/// Returns an error if the forward pass or the GD baseline fails. A failing
/// backward pass only drops the sensitivity comparison.
pub fn alignment(
    model: &IclTransformer,
    learner: &GdLearner,
    tokens: &Tensor,
) -> Result<AlignmentReport> {
    let test_points = model.config().test_points;
    let ours = model
        .predict(tokens, false)
        .context("model prediction")?;
    let gd = learner
        .predict_batch(tokens, test_points)
        .context("gradient-descent baseline")?;
    let prediction_gap = mse(&ours, &gd.predictions)?;

    let sensitivity_cosine = match query_sensitivity(model, tokens) {
        Ok(sensitivity) => Some(mean_cosine(&sensitivity, &gd.weights)?),
        Err(err) => {
            tracing::warn!(error = %err, "skipping sensitivity comparison");
            None
        }
    };

    Ok(AlignmentReport {
        prediction_gap,
        sensitivity_cosine,
    })
}
