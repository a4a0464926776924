//! Logistic churn model loaded from a versioned JSON artifact.
//!
//! Artifact layout:
//!
//! ```json
//! {
//!   "version": "churn-logit-2024-03",
//!   "intercept": -2.65,
//!   "threshold": 0.5,
//!   "features": {
//!     "tenure": { "weight": -0.02, "reference": 32.0, "imputation": "reference" },
//!     "is_mtm": { "weight": 2.0, "reference": 0.55, "imputation": { "default": 0.0 } }
//!   }
//! }
//! ```
//!
//! When the artifact file is missing, a built-in model with the same shape is
//! used so local runs work without a trained artifact.

use churn_core::inference::{Imputation, ScoringError, ScoringModel};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

pub const BUILTIN_MODEL_VERSION: &str = "churn-logit-builtin-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    pub intercept: f64,
    #[serde(default)]
    pub threshold: Option<f64>,
    pub features: BTreeMap<String, FeatureWeight>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeight {
    pub weight: f64,
    /// Population reference value; the attribution baseline.
    pub reference: f64,
    pub imputation: Imputation,
}

impl ModelArtifact {
    /// Default churn model, used when no artifact is deployed.
    pub fn builtin() -> Self {
        let feature = |weight: f64, reference: f64, imputation: Imputation| FeatureWeight {
            weight,
            reference,
            imputation,
        };
        let features = BTreeMap::from([
            ("tenure".to_string(), feature(-0.02, 32.0, Imputation::Reference)),
            (
                "monthly_charge".to_string(),
                feature(0.015, 65.0, Imputation::Reference),
            ),
            ("is_mtm".to_string(), feature(2.0, 0.55, Imputation::Default(0.0))),
            (
                "tickets_30d".to_string(),
                feature(0.45, 0.5, Imputation::Default(0.0)),
            ),
            (
                "last_login_days".to_string(),
                feature(0.04, 10.0, Imputation::Default(10.0)),
            ),
        ]);
        Self {
            version: BUILTIN_MODEL_VERSION.to_string(),
            intercept: -2.65,
            threshold: None,
            features,
        }
    }
}

/// Loaded logistic regression: `p = sigmoid(intercept + w . x)`.
#[derive(Debug)]
pub struct LogisticModel {
    version: String,
    intercept: f64,
    threshold: Option<f64>,
    names: Vec<String>,
    weights: Array1<f64>,
    reference: Array1<f64>,
    imputation: BTreeMap<String, Imputation>,
}

impl LogisticModel {
    /// Load from `path`, falling back to the built-in model if the file does
    /// not exist. A file that exists but cannot be parsed is an error.
    pub fn load(path: &str) -> Result<Self, ScoringError> {
        if !Path::new(path).exists() {
            warn!(path, "Model artifact not found, using built-in churn model");
            return Self::from_artifact(ModelArtifact::builtin());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ScoringError::ModelUnavailable(format!("{path}: {e}")))?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)
            .map_err(|e| ScoringError::ModelUnavailable(format!("{path}: {e}")))?;
        let model = Self::from_artifact(artifact)?;
        info!(path, version = %model.version, features = model.names.len(), "Model artifact loaded");
        Ok(model)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ScoringError> {
        if artifact.features.is_empty() {
            return Err(ScoringError::ModelUnavailable(format!(
                "model {} declares no features",
                artifact.version
            )));
        }
        if let Some(t) = artifact.threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(ScoringError::ModelUnavailable(format!(
                    "model {} threshold {t} outside [0, 1]",
                    artifact.version
                )));
            }
        }
        let non_finite = artifact.features.iter().find(|(_, f)| {
            !f.weight.is_finite()
                || !f.reference.is_finite()
                || matches!(f.imputation, Imputation::Default(v) if !v.is_finite())
        });
        if let Some((name, _)) = non_finite {
            return Err(ScoringError::ModelUnavailable(format!(
                "model {} has a non-finite parameter for '{name}'",
                artifact.version
            )));
        }

        let names: Vec<String> = artifact.features.keys().cloned().collect();
        let weights = artifact.features.values().map(|f| f.weight).collect();
        let reference = artifact.features.values().map(|f| f.reference).collect();
        let imputation = artifact
            .features
            .into_iter()
            .map(|(name, f)| (name, f.imputation))
            .collect();

        Ok(Self {
            version: artifact.version,
            intercept: artifact.intercept,
            threshold: artifact.threshold,
            names,
            weights,
            reference,
            imputation,
        })
    }
}

impl ScoringModel for LogisticModel {
    fn version(&self) -> &str {
        &self.version
    }

    fn feature_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn imputation(&self, feature: &str) -> Imputation {
        self.imputation
            .get(feature)
            .cloned()
            .unwrap_or(Imputation::Required)
    }

    fn reference(&self) -> BTreeMap<String, f64> {
        self.names
            .iter()
            .cloned()
            .zip(self.reference.iter().copied())
            .collect()
    }

    fn predict_proba(&self, inputs: &BTreeMap<String, f64>) -> Result<f64, ScoringError> {
        let mut x = Array1::<f64>::zeros(self.names.len());
        for (i, name) in self.names.iter().enumerate() {
            x[i] = *inputs.get(name).ok_or_else(|| ScoringError::MissingFeature {
                feature: name.clone(),
                model_version: self.version.clone(),
            })?;
        }
        let z = self.intercept + self.weights.dot(&x);
        Ok(sigmoid(z))
    }

    fn threshold(&self) -> Option<f64> {
        self.threshold
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_builtin_reference_probability() {
        let model = LogisticModel::from_artifact(ModelArtifact::builtin()).unwrap();
        let p = model.predict_proba(&model.reference()).unwrap();
        // z = -0.59
        assert!((p - 0.356_634).abs() < 1e-5, "{p}");
    }

    #[test]
    fn test_builtin_high_risk_customer() {
        let model = LogisticModel::from_artifact(ModelArtifact::builtin()).unwrap();
        let p = model
            .predict_proba(&inputs(&[
                ("tenure", 5.0),
                ("monthly_charge", 65.0),
                ("is_mtm", 1.0),
                ("tickets_30d", 2.0),
                ("last_login_days", 10.0),
            ]))
            .unwrap();
        // z = 1.525
        assert!((p - 0.821_29).abs() < 1e-4, "{p}");
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let model = LogisticModel::from_artifact(ModelArtifact::builtin()).unwrap();
        let err = model.predict_proba(&inputs(&[("tenure", 5.0)])).unwrap_err();
        assert!(matches!(err, ScoringError::MissingFeature { .. }));
    }

    #[test]
    fn test_artifact_parses_imputation_policies() {
        let json = r#"{
            "version": "v7",
            "intercept": 0.1,
            "threshold": 0.4,
            "features": {
                "a": {"weight": 1.0, "reference": 0.0, "imputation": "required"},
                "b": {"weight": 2.0, "reference": 3.0, "imputation": {"default": 4.0}}
            }
        }"#;
        let artifact: ModelArtifact = serde_json::from_str(json).unwrap();
        let model = LogisticModel::from_artifact(artifact).unwrap();
        assert_eq!(model.version(), "v7");
        assert_eq!(model.threshold(), Some(0.4));
        assert_eq!(model.imputation("a"), Imputation::Required);
        assert_eq!(model.imputation("b"), Imputation::Default(4.0));
        assert_eq!(model.imputation("unknown"), Imputation::Required);
    }

    #[test]
    fn test_invalid_artifacts_rejected() {
        let mut empty = ModelArtifact::builtin();
        empty.features.clear();
        assert!(LogisticModel::from_artifact(empty).is_err());

        let mut bad_threshold = ModelArtifact::builtin();
        bad_threshold.threshold = Some(1.5);
        assert!(LogisticModel::from_artifact(bad_threshold).is_err());

        let mut nan = ModelArtifact::builtin();
        if let Some(f) = nan.features.get_mut("tenure") {
            f.weight = f64::NAN;
        }
        assert!(LogisticModel::from_artifact(nan).is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_builtin() {
        let model = LogisticModel::load("/nonexistent/churn_model.json").unwrap();
        assert_eq!(model.version(), BUILTIN_MODEL_VERSION);
    }
}
