//! Scoring model abstraction.
//!
//! The pipeline consumes a trained, versioned model as a black box through the
//! [`ScoringModel`] trait. The scorer and the explainability engine only ever
//! call [`ScoringModel::predict_proba`], so any artifact format can be plugged in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A trained, versioned churn model.
pub trait ScoringModel: Send + Sync {
    /// Artifact version written alongside every prediction.
    fn version(&self) -> &str;

    /// Input features in the order the model expects them.
    fn feature_names(&self) -> Vec<String>;

    /// How a missing input feature is filled before scoring.
    fn imputation(&self, feature: &str) -> Imputation;

    /// Reference input vector. Its probability is the attribution baseline.
    fn reference(&self) -> BTreeMap<String, f64>;

    /// Raw probability for a complete input vector (no imputation applied).
    fn predict_proba(&self, inputs: &BTreeMap<String, f64>) -> Result<f64, ScoringError>;

    /// Decision threshold baked into the artifact, if any.
    fn threshold(&self) -> Option<f64> {
        None
    }
}

/// Per-feature default-imputation policy. Declared by the artifact, never inferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Imputation {
    /// Missing value is a scoring error.
    Required,
    /// Use the model's reference value for the feature.
    Reference,
    /// Use a fixed value.
    Default(f64),
}

/// Errors that can occur while scoring or explaining.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoringError {
    /// A feature the model requires is absent and has no imputation.
    MissingFeature { feature: String, model_version: String },
    /// The model artifact could not be loaded or is not available.
    ModelUnavailable(String),
    /// The model was swapped between scoring and explaining.
    VersionMismatch { scored: String, current: String },
    /// Scoring did not finish within its deadline.
    Timeout(String),
    /// The model produced a non-finite probability.
    InvalidOutput(String),
}

impl fmt::Display for ScoringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringError::MissingFeature {
                feature,
                model_version,
            } => write!(f, "missing required feature '{feature}' for model {model_version}"),
            ScoringError::ModelUnavailable(msg) => write!(f, "model unavailable: {msg}"),
            ScoringError::VersionMismatch { scored, current } => {
                write!(f, "model changed from {scored} to {current} during explanation")
            }
            ScoringError::Timeout(msg) => write!(f, "scoring timeout: {msg}"),
            ScoringError::InvalidOutput(msg) => write!(f, "invalid model output: {msg}"),
        }
    }
}

impl std::error::Error for ScoringError {}
