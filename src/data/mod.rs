//! In-context task generation.

pub mod regression;

pub use regression::{RegressionBatch, RegressionTaskConfig, TaskKind, mse};
