//! Explicit gradient descent on the in-context examples.
//!
//! The baseline the transformer is compared against: start from `w = 0` and
//! take `steps` full-batch steps on `L(w) = 1/(2N) * sum (w . x_i - y_i)^2`.

use candle_core::{Device, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Full-batch gradient descent learner for linear regression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GdLearner {
    pub learning_rate: f64,
    pub steps: usize,
}

/// Output of [`GdLearner::predict_batch`].
#[derive(Debug, Clone)]
pub struct GdPrediction {
    /// Query predictions, (batch, test_points)
    pub predictions: Tensor,
    /// Learned weight vector per sequence, (batch, input_size)
    pub weights: Tensor,
}

impl GdLearner {
    #[must_use]
    pub fn new(learning_rate: f64, steps: usize) -> Self {
        Self {
            learning_rate,
            steps,
        }
    }

    /// Run gradient descent from zero on the given examples.
    ///
    /// Every row of `xs` must have the same length. An empty context leaves
    /// the weights at zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(&self, xs: &[Vec<f64>], ys: &[f64]) -> Vec<f64> {
        let d = xs.first().map_or(0, Vec::len);
        let mut w = vec![0.0; d];
        if xs.is_empty() {
            return w;
        }
        let n = xs.len() as f64;

        for _ in 0..self.steps {
            let mut grad = vec![0.0; d];
            for (x, &y) in xs.iter().zip(ys) {
                let residual = dot(&w, x) - y;
                for (g, xi) in grad.iter_mut().zip(x) {
                    *g += residual * xi;
                }
            }
            for (wi, g) in w.iter_mut().zip(&grad) {
                *wi -= self.learning_rate * g / n;
            }
        }
        w
    }

    /// Fit every sequence of a token batch on its context and predict its queries.
    ///
    /// # Arguments
    /// * `tokens` - (batch, context + test_points, input_size + 1) `[x, y]` tokens
    /// * `test_points` - Number of trailing query tokens
    ///
    /// # Errors
    /// Returns an error if the batch is malformed or tensor operations fail.
    #[allow(clippy::cast_possible_truncation)]
    pub fn predict_batch(&self, tokens: &Tensor, test_points: usize) -> Result<GdPrediction> {
        let (b, t, width) = tokens.dims3()?;
        if width < 2 || t <= test_points {
            return Err(candle_core::Error::Msg(format!(
                "cannot split ({b}, {t}, {width}) tokens into context and {test_points} queries"
            )));
        }
        let context = t - test_points;
        let d = width - 1;
        let device: &Device = tokens.device();

        let seqs: Vec<Vec<Vec<f32>>> = tokens.to_dtype(candle_core::DType::F32)?.to_vec3()?;
        let mut predictions = Vec::with_capacity(b * test_points);
        let mut weights = Vec::with_capacity(b * d);

        for seq in &seqs {
            let xs: Vec<Vec<f64>> = seq[..context]
                .iter()
                .map(|tok| tok[..d].iter().map(|&v| f64::from(v)).collect())
                .collect();
            let ys: Vec<f64> = seq[..context].iter().map(|tok| f64::from(tok[d])).collect();
            let w = self.fit(&xs, &ys);

            for query in &seq[context..] {
                let x: Vec<f64> = query[..d].iter().map(|&v| f64::from(v)).collect();
                predictions.push(dot(&w, &x) as f32);
            }
            weights.extend(w.iter().map(|&v| v as f32));
        }

        Ok(GdPrediction {
            predictions: Tensor::from_vec(predictions, (b, test_points), device)?,
            weights: Tensor::from_vec(weights, (b, d), device)?,
        })
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_step_is_scaled_correlation() {
        let xs = vec![vec![1.0, 0.0], vec![0.0, 2.0]];
        let ys = vec![3.0, 4.0];
        let w = GdLearner::new(0.5, 1).fit(&xs, &ys);
        // w = lr / N * sum y_i x_i = 0.25 * (3, 8)
        assert!((w[0] - 0.75).abs() < 1e-12);
        assert!((w[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_converges_on_noise_free_data() {
        let truth = [0.5, -1.5, 2.0];
        let xs = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![1.0, 1.0, 0.0],
            vec![0.0, 1.0, 1.0],
            vec![1.0, 0.0, 1.0],
        ];
        let ys: Vec<f64> = xs.iter().map(|x| dot(x, &truth)).collect();

        let w = GdLearner::new(0.5, 5000).fit(&xs, &ys);
        for (a, b) in w.iter().zip(truth) {
            assert!((a - b).abs() < 1e-3, "{w:?}");
        }
    }

    #[test]
    fn test_zero_steps_predicts_zero() {
        let tokens = Tensor::new(
            &[[[1.0f32, 2.0], [2.0, 4.0], [3.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let out = GdLearner::new(0.1, 0).predict_batch(&tokens, 1).unwrap();
        let preds: Vec<Vec<f32>> = out.predictions.to_vec2().unwrap();
        assert_eq!(preds, vec![vec![0.0]]);
    }

    #[test]
    fn test_predict_batch_uses_context_only() {
        // y = 2x on the context; query label slot holds garbage that must be ignored
        let tokens = Tensor::new(
            &[[[1.0f32, 2.0], [-1.0, -2.0], [0.5, 99.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let out = GdLearner::new(1.0, 50).predict_batch(&tokens, 1).unwrap();
        let preds: Vec<Vec<f32>> = out.predictions.to_vec2().unwrap();
        assert!((preds[0][0] - 1.0).abs() < 1e-4);
        assert_eq!(out.weights.dims(), &[1, 1]);
    }

    #[test]
    fn test_predict_batch_rejects_missing_context() {
        let tokens = Tensor::zeros((1, 2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(GdLearner::new(0.1, 1).predict_batch(&tokens, 2).is_err());
    }
}
