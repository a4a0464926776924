//! Model scorer: owns the active model and turns feature vectors into scores.
//!
//! Scoring is a pure function of the feature vector and the active artifact.
//! The artifact can be hot-swapped; callers that need a stable view across
//! several calls take it once with [`ModelScorer::current_model`].

use crate::model::LogisticModel;
use churn_core::config::ModelConfig;
use churn_core::inference::{Imputation, ScoringError, ScoringModel};
use churn_core::types::{FeatureVector, Score};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub const DEFAULT_THRESHOLD: f64 = 0.5;

pub struct ModelScorer {
    model: RwLock<Arc<dyn ScoringModel>>,
    /// Configured threshold; wins over the artifact's.
    threshold: Option<f64>,
}

impl ModelScorer {
    pub fn new(model: Arc<dyn ScoringModel>, threshold: Option<f64>) -> Self {
        Self {
            model: RwLock::new(model),
            threshold,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ScoringError> {
        let model = LogisticModel::load(&config.artifact_path)?;
        info!(version = model.version(), "Model scorer initialized");
        Ok(Self::new(Arc::new(model), config.threshold))
    }

    pub fn current_model(&self) -> Arc<dyn ScoringModel> {
        self.model.read().clone()
    }

    pub fn model_version(&self) -> String {
        self.model.read().version().to_string()
    }

    /// Score with the active model.
    pub fn score(&self, vector: &FeatureVector) -> Result<Score, ScoringError> {
        let model = self.current_model();
        self.score_with(model.as_ref(), vector)
    }

    pub fn score_with(
        &self,
        model: &dyn ScoringModel,
        vector: &FeatureVector,
    ) -> Result<Score, ScoringError> {
        let start = Instant::now();
        let inputs = impute(model, &vector.features)?;
        let raw = model.predict_proba(&inputs)?;
        if !raw.is_finite() {
            return Err(ScoringError::InvalidOutput(format!(
                "model {} returned {raw} for {}/{}",
                model.version(),
                vector.entity_id,
                vector.window_id
            )));
        }
        let probability = raw.clamp(0.0, 1.0);
        let threshold = self
            .threshold
            .or_else(|| model.threshold())
            .unwrap_or(DEFAULT_THRESHOLD);
        metrics::histogram!("scoring.latency_us").record(start.elapsed().as_micros() as f64);

        Ok(Score {
            probability,
            flag: probability >= threshold,
            model_version: model.version().to_string(),
        })
    }

    /// Swap in a new artifact. In-flight calls keep the model they started with.
    pub fn reload_model(&self, path: &str) -> Result<(), ScoringError> {
        info!(path, "Hot-reloading model");
        let model = LogisticModel::load(path)?;
        let version = model.version().to_string();
        *self.model.write() = Arc::new(model);
        info!(version = %version, "Model hot-reload complete");
        Ok(())
    }
}

/// Fill the model's inputs from a feature vector, applying each feature's
/// declared imputation policy. Features the model does not use are ignored.
pub fn impute(
    model: &dyn ScoringModel,
    features: &BTreeMap<String, f64>,
) -> Result<BTreeMap<String, f64>, ScoringError> {
    let reference = model.reference();
    let mut inputs = BTreeMap::new();
    for name in model.feature_names() {
        let value = match features.get(&name) {
            Some(v) if v.is_finite() => *v,
            _ => match model.imputation(&name) {
                Imputation::Default(v) => v,
                Imputation::Reference => match reference.get(&name) {
                    Some(v) => *v,
                    None => {
                        return Err(ScoringError::MissingFeature {
                            feature: name,
                            model_version: model.version().to_string(),
                        })
                    }
                },
                Imputation::Required => {
                    return Err(ScoringError::MissingFeature {
                        feature: name,
                        model_version: model.version().to_string(),
                    })
                }
            },
        };
        inputs.insert(name, value);
    }
    Ok(inputs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{FeatureWeight, ModelArtifact};
    use chrono::Utc;
    use churn_core::types::WindowId;

    fn vector(pairs: &[(&str, f64)]) -> FeatureVector {
        FeatureVector {
            entity_id: "C1".into(),
            window_id: WindowId(1),
            as_of_time: Utc::now(),
            features: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn builtin_scorer(threshold: Option<f64>) -> ModelScorer {
        let model = LogisticModel::from_artifact(ModelArtifact::builtin()).unwrap();
        ModelScorer::new(Arc::new(model), threshold)
    }

    #[test]
    fn test_scenario_vector_is_high_risk() {
        let scorer = builtin_scorer(None);
        let score = scorer
            .score(&vector(&[("tenure", 5.0), ("is_mtm", 1.0), ("tickets_30d", 2.0)]))
            .unwrap();
        assert!((score.probability - 0.82).abs() < 0.005, "{}", score.probability);
        assert!(score.flag);
        assert_eq!(score.model_version, crate::model::BUILTIN_MODEL_VERSION);
    }

    #[test]
    fn test_configured_threshold_overrides_default() {
        let fv = vector(&[("tenure", 5.0), ("is_mtm", 1.0), ("tickets_30d", 2.0)]);
        assert!(!builtin_scorer(Some(0.9)).score(&fv).unwrap().flag);
    }

    #[test]
    fn test_required_feature_missing() {
        let mut artifact = ModelArtifact::builtin();
        artifact.features.insert(
            "contract_age".into(),
            FeatureWeight {
                weight: 0.1,
                reference: 1.0,
                imputation: Imputation::Required,
            },
        );
        let scorer = ModelScorer::new(Arc::new(LogisticModel::from_artifact(artifact).unwrap()), None);
        let err = scorer.score(&vector(&[("tenure", 5.0)])).unwrap_err();
        assert_eq!(
            err,
            ScoringError::MissingFeature {
                feature: "contract_age".into(),
                model_version: crate::model::BUILTIN_MODEL_VERSION.into(),
            }
        );
    }

    #[test]
    fn test_imputation_uses_declared_policy() {
        let model = LogisticModel::from_artifact(ModelArtifact::builtin()).unwrap();
        let inputs = impute(&model, &BTreeMap::from([("tenure".to_string(), 5.0)])).unwrap();
        assert_eq!(inputs["tenure"], 5.0);
        assert_eq!(inputs["monthly_charge"], 65.0);
        assert_eq!(inputs["is_mtm"], 0.0);
        assert_eq!(inputs["last_login_days"], 10.0);
    }

    #[test]
    fn test_hot_reload_swaps_version() {
        let scorer = builtin_scorer(None);
        let before = scorer.current_model();

        let mut artifact = ModelArtifact::builtin();
        artifact.version = "churn-logit-test-v2".into();
        let path = std::env::temp_dir().join(format!("churn-model-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string(&artifact).unwrap()).unwrap();

        scorer.reload_model(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(scorer.model_version(), "churn-logit-test-v2");
        assert_eq!(before.version(), crate::model::BUILTIN_MODEL_VERSION);
    }
}
