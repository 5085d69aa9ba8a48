//! # aac-surrogate
//!
//! Regression surrogate for model-based configuration: a random forest that
//! learns from censored runtime observations, plus the feature projection and
//! low-discrepancy sampling it is used with.

pub mod forest;
pub mod gaussian;
pub mod pca;
pub mod sequence;

pub use forest::{CensoredRandomForest, ForestConfig, Observation, Prediction};
pub use pca::Pca;
pub use sequence::HaltonSequence;

/// Errors raised while building or querying the surrogate.
#[derive(Debug, thiserror::Error)]
pub enum SurrogateError {
    #[error("parameter {name} has a domain the model cannot encode")]
    UnsupportedDomain { name: String },
    #[error("no training data")]
    EmptyTrainingSet,
    #[error("dimension mismatch: expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("model has not been fitted")]
    NotFitted,
}

/// Result alias for surrogate operations.
pub type SurrogateResult<T> = Result<T, SurrogateError>;
