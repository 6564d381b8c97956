//! Gradient descent as an in-context learner, and as attention weights.

pub mod alignment;
pub mod construction;
pub mod learner;

pub use alignment::{AlignmentReport, alignment, mean_cosine, query_sensitivity};
pub use construction::{check_constructible, construct_gd_weights, gd_transformer};
pub use learner::{GdLearner, GdPrediction};
