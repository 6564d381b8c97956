//! In-context regression tasks.
//!
//! Every sequence holds `context_len` labelled examples `[x, y]` followed by
//! `test_points` queries `[x, 0]`. Each sequence draws its own task, so the
//! only way to predict a query is to learn from the context.

use candle_core::{Device, Result, Tensor};
use rand::Rng;
use rand::distributions::Uniform;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Family of target functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// `y = w . x + noise`
    #[default]
    Linear,
    /// `y = a * sin(w . x + phase) + noise`
    Sinusoid,
}

/// Task sampler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionTaskConfig {
    /// Feature dimension of `x`
    pub input_size: usize,
    /// Labelled examples per sequence
    pub context_len: usize,
    /// Query tokens per sequence
    pub test_points: usize,
    pub batch_size: usize,
    /// `x` is drawn uniformly from `[-input_range, input_range]`
    pub input_range: f64,
    /// Standard deviation of the task weights
    pub weight_scale: f64,
    /// Standard deviation of label noise (context examples only)
    pub noise_std: f64,
    pub kind: TaskKind,
}

impl Default for RegressionTaskConfig {
    fn default() -> Self {
        Self {
            input_size: 10,
            context_len: 20,
            test_points: 1,
            batch_size: 32,
            input_range: 1.0,
            weight_scale: 1.0,
            noise_std: 0.0,
            kind: TaskKind::Linear,
        }
    }
}

/// A batch of sampled sequences.
#[derive(Debug, Clone)]
pub struct RegressionBatch {
    /// (batch, context_len + test_points, input_size + 1)
    pub tokens: Tensor,
    /// Noise-free query labels, (batch, test_points)
    pub targets: Tensor,
    /// Task weight vector of each sequence, (batch, input_size)
    pub weights: Tensor,
}

impl RegressionTaskConfig {
    /// Tokens per sequence.
    #[must_use]
    pub fn sequence_len(&self) -> usize {
        self.context_len + self.test_points
    }

    /// Width of one `[x, y]` token.
    #[must_use]
    pub fn token_width(&self) -> usize {
        self.input_size + 1
    }

    /// Draw a batch of tasks.
    ///
    /// # Errors
    /// Returns an error for degenerate settings (empty dimensions, non-positive
    /// range, negative scales) or if tensor creation fails.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, device: &Device) -> Result<RegressionBatch> {
        if self.input_size == 0 || self.context_len == 0 || self.test_points == 0 {
            return Err(candle_core::Error::Msg(
                "input_size, context_len and test_points must be positive".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(candle_core::Error::Msg("batch_size must be positive".into()));
        }
        if self.input_range <= 0.0 {
            return Err(candle_core::Error::Msg(format!(
                "input_range must be positive, got {}",
                self.input_range
            )));
        }
        let normal = |std: f64, what: &str| {
            Normal::new(0.0, std)
                .map_err(|e| candle_core::Error::Msg(format!("invalid {what}: {e}")))
        };
        let weight_dist = normal(self.weight_scale, "weight_scale")?;
        let noise_dist = normal(self.noise_std, "noise_std")?;
        let x_dist = Uniform::new(-self.input_range, self.input_range);
        let amplitude_dist = Uniform::new(0.1, 5.0);
        let phase_dist = Uniform::new(0.0, std::f64::consts::PI);

        let d = self.input_size;
        let seq = self.sequence_len();
        let mut tokens = Vec::with_capacity(self.batch_size * seq * (d + 1));
        let mut targets = Vec::with_capacity(self.batch_size * self.test_points);
        let mut weights = Vec::with_capacity(self.batch_size * d);

        for _ in 0..self.batch_size {
            let w: Vec<f64> = (0..d).map(|_| weight_dist.sample(rng)).collect();
            let (amplitude, phase) = match self.kind {
                TaskKind::Linear => (1.0, 0.0),
                TaskKind::Sinusoid => (amplitude_dist.sample(rng), phase_dist.sample(rng)),
            };
            weights.extend(w.iter().map(|&v| v as f32));

            for i in 0..seq {
                let x: Vec<f64> = (0..d).map(|_| x_dist.sample(rng)).collect();
                let dot: f64 = x.iter().zip(&w).map(|(a, b)| a * b).sum();
                let clean = match self.kind {
                    TaskKind::Linear => dot,
                    TaskKind::Sinusoid => amplitude * (dot + phase).sin(),
                };

                tokens.extend(x.iter().map(|&v| v as f32));
                if i < self.context_len {
                    let noise = if self.noise_std > 0.0 {
                        noise_dist.sample(rng)
                    } else {
                        0.0
                    };
                    tokens.push((clean + noise) as f32);
                } else {
                    tokens.push(0.0);
                    targets.push(clean as f32);
                }
            }
        }

        Ok(RegressionBatch {
            tokens: Tensor::from_vec(tokens, (self.batch_size, seq, d + 1), device)?,
            targets: Tensor::from_vec(targets, (self.batch_size, self.test_points), device)?,
            weights: Tensor::from_vec(weights, (self.batch_size, d), device)?,
        })
    }
}

/// Mean squared error between two tensors of equal shape.
///
/// # Errors
/// Returns an error if shapes differ or tensor operations fail.
pub fn mse(prediction: &Tensor, target: &Tensor) -> Result<f32> {
    (prediction - target)?
        .sqr()?
        .mean_all()?
        .to_dtype(candle_core::DType::F32)?
        .to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn config() -> RegressionTaskConfig {
        RegressionTaskConfig {
            input_size: 3,
            context_len: 5,
            test_points: 2,
            batch_size: 4,
            ..RegressionTaskConfig::default()
        }
    }

    #[test]
    fn test_shapes_and_zeroed_queries() {
        let mut rng = StdRng::seed_from_u64(0);
        let batch = config().sample(&mut rng, &Device::Cpu).unwrap();
        assert_eq!(batch.tokens.dims(), &[4, 7, 4]);
        assert_eq!(batch.targets.dims(), &[4, 2]);
        assert_eq!(batch.weights.dims(), &[4, 3]);

        let tokens: Vec<Vec<Vec<f32>>> = batch.tokens.to_vec3().unwrap();
        for seq in &tokens {
            assert_eq!(seq[5][3], 0.0);
            assert_eq!(seq[6][3], 0.0);
            for token in seq {
                assert!(token[..3].iter().all(|v| v.abs() <= 1.0));
            }
        }
    }

    #[test]
    fn test_linear_labels_follow_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let batch = config().sample(&mut rng, &Device::Cpu).unwrap();
        let tokens: Vec<Vec<Vec<f32>>> = batch.tokens.to_vec3().unwrap();
        let weights: Vec<Vec<f32>> = batch.weights.to_vec2().unwrap();
        let targets: Vec<Vec<f32>> = batch.targets.to_vec2().unwrap();

        for ((seq, w), t) in tokens.iter().zip(&weights).zip(&targets) {
            let label = |tok: &[f32]| tok[..3].iter().zip(w).map(|(a, b)| a * b).sum::<f32>();
            assert!((label(&seq[0]) - seq[0][3]).abs() < 1e-5);
            assert!((label(&seq[5]) - t[0]).abs() < 1e-5);
            assert!((label(&seq[6]) - t[1]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_seed_is_reproducible() {
        let cfg = RegressionTaskConfig {
            kind: TaskKind::Sinusoid,
            noise_std: 0.1,
            ..config()
        };
        let a = cfg.sample(&mut StdRng::seed_from_u64(3), &Device::Cpu).unwrap();
        let b = cfg.sample(&mut StdRng::seed_from_u64(3), &Device::Cpu).unwrap();
        let a: Vec<Vec<Vec<f32>>> = a.tokens.to_vec3().unwrap();
        let b: Vec<Vec<Vec<f32>>> = b.tokens.to_vec3().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_degenerate_settings() {
        let mut rng = StdRng::seed_from_u64(0);
        let cfg = RegressionTaskConfig {
            input_range: 0.0,
            ..config()
        };
        assert!(cfg.sample(&mut rng, &Device::Cpu).is_err());

        let cfg = RegressionTaskConfig {
            noise_std: -1.0,
            ..config()
        };
        assert!(cfg.sample(&mut rng, &Device::Cpu).is_err());
    }

    #[test]
    fn test_mse() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &device).unwrap();
        let b = Tensor::new(&[[1.0f32, 0.0], [3.0, 6.0]], &device).unwrap();
        assert!((mse(&a, &b).unwrap() - 2.0).abs() < 1e-6);
    }
}
