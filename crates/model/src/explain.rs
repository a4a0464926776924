//! Per-feature attribution of churn scores.
//!
//! Contributions are Shapley values of the clipped model output, using the
//! model's reference vector as the "feature absent" value. They sum to
//! `probability - baseline_probability`, where the baseline is the score of
//! the reference vector. Small models are attributed exactly; above
//! `max_exact_features` two deterministic feature-ordering paths (name order
//! and its reverse) are averaged, which keeps the sum exact.

use crate::engine::{impute, ModelScorer};
use churn_core::config::{ExplainConfig, MAX_EXACT_FEATURES};
use churn_core::inference::{ScoringError, ScoringModel};
use churn_core::types::{FeatureVector, RiskFactor, Score};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub baseline_probability: f64,
    /// Ranked by descending absolute contribution, ties by feature name.
    pub factors: Vec<RiskFactor>,
}

pub struct ExplainabilityEngine {
    scorer: Arc<ModelScorer>,
    config: ExplainConfig,
}

impl ExplainabilityEngine {
    pub fn new(scorer: Arc<ModelScorer>, config: ExplainConfig) -> Self {
        Self { scorer, config }
    }

    pub fn explain(&self, vector: &FeatureVector, score: &Score) -> Result<Explanation, ScoringError> {
        let model = self.scorer.current_model();
        if model.version() != score.model_version {
            return Err(ScoringError::VersionMismatch {
                scored: score.model_version.clone(),
                current: model.version().to_string(),
            });
        }

        let inputs = impute(model.as_ref(), &vector.features)?;
        let game = Game {
            model: model.as_ref(),
            names: model.feature_names(),
            inputs,
            reference: model.reference(),
        };

        let baseline_probability = game.value(&vec![false; game.names.len()])?;
        let exact_limit = self.config.max_exact_features.min(MAX_EXACT_FEATURES);
        let contributions = if game.names.len() <= exact_limit {
            game.exact_shapley()?
        } else {
            debug!(
                features = game.names.len(),
                "Feature count above exact limit, using path attribution"
            );
            game.path_attribution()?
        };

        let total: f64 = contributions.iter().sum();
        let expected = score.probability - baseline_probability;
        if (total - expected).abs() > self.config.tolerance {
            return Err(ScoringError::InvalidOutput(format!(
                "attributions for {}/{} sum to {total}, expected {expected}",
                vector.entity_id, vector.window_id
            )));
        }

        let mut factors: Vec<RiskFactor> = game
            .names
            .into_iter()
            .zip(contributions)
            .map(|(feature, contribution)| RiskFactor {
                feature,
                contribution,
            })
            .collect();
        factors.sort_by(|a, b| {
            b.contribution
                .abs()
                .total_cmp(&a.contribution.abs())
                .then_with(|| a.feature.cmp(&b.feature))
        });
        if let Some(k) = self.config.top_k {
            factors.truncate(k);
        }

        Ok(Explanation {
            baseline_probability,
            factors,
        })
    }
}

/// Cooperative game over the model inputs: a coalition takes the actual
/// value for its members and the reference value for everyone else.
struct Game<'a> {
    model: &'a dyn ScoringModel,
    names: Vec<String>,
    inputs: BTreeMap<String, f64>,
    reference: BTreeMap<String, f64>,
}

impl Game<'_> {
    fn value(&self, present: &[bool]) -> Result<f64, ScoringError> {
        let mut mixed = BTreeMap::new();
        for (name, on) in self.names.iter().zip(present) {
            let source = if *on { &self.inputs } else { &self.reference };
            let value = source.get(name).copied().unwrap_or_default();
            mixed.insert(name.clone(), value);
        }
        let p = self.model.predict_proba(&mixed)?;
        if !p.is_finite() {
            return Err(ScoringError::InvalidOutput(format!(
                "model {} returned {p} during attribution",
                self.model.version()
            )));
        }
        Ok(p.clamp(0.0, 1.0))
    }

    fn exact_shapley(&self) -> Result<Vec<f64>, ScoringError> {
        let n = self.names.len();
        let coalitions = 1usize << n;
        let mut values = Vec::with_capacity(coalitions);
        let mut present = vec![false; n];
        for mask in 0..coalitions {
            for (i, slot) in present.iter_mut().enumerate() {
                *slot = mask & (1 << i) != 0;
            }
            values.push(self.value(&present)?);
        }

        // |S|! (n - |S| - 1)! / n!
        let weights: Vec<f64> = (0..n)
            .map(|size| 1.0 / (n as f64 * binomial(n - 1, size)))
            .collect();

        let mut phi = vec![0.0; n];
        for (i, contribution) in phi.iter_mut().enumerate() {
            let bit = 1usize << i;
            for mask in (0..coalitions).filter(|m| m & bit == 0) {
                let size = mask.count_ones() as usize;
                *contribution += weights[size] * (values[mask | bit] - values[mask]);
            }
        }
        Ok(phi)
    }

    fn path_attribution(&self) -> Result<Vec<f64>, ScoringError> {
        let n = self.names.len();
        let forward: Vec<usize> = (0..n).collect();
        let reverse: Vec<usize> = (0..n).rev().collect();
        let mut phi = vec![0.0; n];
        for order in [forward, reverse] {
            let mut present = vec![false; n];
            let mut previous = self.value(&present)?;
            for i in order {
                present[i] = true;
                let current = self.value(&present)?;
                phi[i] += (current - previous) / 2.0;
                previous = current;
            }
        }
        Ok(phi)
    }
}

fn binomial(n: usize, k: usize) -> f64 {
    let k = k.min(n - k);
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{FeatureWeight, LogisticModel, ModelArtifact};
    use chrono::Utc;
    use churn_core::inference::Imputation;
    use churn_core::types::WindowId;

    fn scorer(artifact: ModelArtifact) -> Arc<ModelScorer> {
        Arc::new(ModelScorer::new(
            Arc::new(LogisticModel::from_artifact(artifact).unwrap()),
            None,
        ))
    }

    fn engine(scorer: Arc<ModelScorer>, max_exact_features: usize, top_k: Option<usize>) -> ExplainabilityEngine {
        ExplainabilityEngine::new(
            scorer,
            ExplainConfig {
                max_exact_features,
                tolerance: 1e-6,
                top_k,
            },
        )
    }

    fn scenario_vector() -> FeatureVector {
        FeatureVector {
            entity_id: "C1".into(),
            window_id: WindowId(1),
            as_of_time: Utc::now(),
            features: BTreeMap::from([
                ("tenure".to_string(), 5.0),
                ("is_mtm".to_string(), 1.0),
                ("tickets_30d".to_string(), 2.0),
            ]),
        }
    }

    #[test]
    fn test_scenario_top_factor_is_contract() {
        let scorer = scorer(ModelArtifact::builtin());
        let fv = scenario_vector();
        let score = scorer.score(&fv).unwrap();
        let explanation = engine(scorer, 12, None).explain(&fv, &score).unwrap();

        assert_eq!(explanation.factors[0].feature, "is_mtm");
        assert!(explanation.factors[0].contribution > 0.0);
        let total: f64 = explanation.factors.iter().map(|f| f.contribution).sum();
        assert!((total - (score.probability - explanation.baseline_probability)).abs() < 1e-6);
        // Features at their reference value contribute nothing.
        let monthly = explanation
            .factors
            .iter()
            .find(|f| f.feature == "monthly_charge")
            .unwrap();
        assert!(monthly.contribution.abs() < 1e-12);
    }

    #[test]
    fn test_path_attribution_sums_to_delta() {
        let scorer = scorer(ModelArtifact::builtin());
        let fv = scenario_vector();
        let score = scorer.score(&fv).unwrap();
        let explanation = engine(scorer, 2, None).explain(&fv, &score).unwrap();
        let total: f64 = explanation.factors.iter().map(|f| f.contribution).sum();
        assert!((total - (score.probability - explanation.baseline_probability)).abs() < 1e-6);
        assert_eq!(explanation.factors.len(), 5);
    }

    #[test]
    fn test_ties_broken_by_name_and_reproducible() {
        let mut artifact = ModelArtifact::builtin();
        artifact.features = BTreeMap::from([
            (
                "b".to_string(),
                FeatureWeight {
                    weight: 1.0,
                    reference: 0.0,
                    imputation: Imputation::Required,
                },
            ),
            (
                "a".to_string(),
                FeatureWeight {
                    weight: 1.0,
                    reference: 0.0,
                    imputation: Imputation::Required,
                },
            ),
        ]);
        let scorer = scorer(artifact);
        let fv = FeatureVector {
            entity_id: "C2".into(),
            window_id: WindowId(3),
            as_of_time: Utc::now(),
            features: BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 1.0)]),
        };
        let score = scorer.score(&fv).unwrap();
        let engine = engine(scorer, 12, None);
        let first = engine.explain(&fv, &score).unwrap();
        let second = engine.explain(&fv, &score).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.factors[0].feature, "a");
        assert_eq!(first.factors[1].feature, "b");
    }

    #[test]
    fn test_top_k_applied_after_consistency_check() {
        let scorer = scorer(ModelArtifact::builtin());
        let fv = scenario_vector();
        let score = scorer.score(&fv).unwrap();
        let explanation = engine(scorer, 12, Some(2)).explain(&fv, &score).unwrap();
        assert_eq!(explanation.factors.len(), 2);
        assert_eq!(explanation.factors[0].feature, "is_mtm");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let scorer = scorer(ModelArtifact::builtin());
        let fv = scenario_vector();
        let mut score = scorer.score(&fv).unwrap();
        score.model_version = "older".into();
        let err = engine(scorer, 12, None).explain(&fv, &score).unwrap_err();
        assert!(matches!(err, ScoringError::VersionMismatch { .. }));
    }

    #[test]
    fn test_wide_model_never_enumerates_exactly() {
        let mut artifact = ModelArtifact::builtin();
        artifact.features = (0..64)
            .map(|i| {
                (
                    format!("f{i:02}"),
                    FeatureWeight {
                        weight: 0.01 * (i % 5) as f64,
                        reference: 0.0,
                        imputation: Imputation::Required,
                    },
                )
            })
            .collect();
        let scorer = scorer(artifact);
        let fv = FeatureVector {
            entity_id: "C64".into(),
            window_id: WindowId(1),
            as_of_time: Utc::now(),
            features: (0..64).map(|i| (format!("f{i:02}"), 1.0)).collect(),
        };
        let score = scorer.score(&fv).unwrap();
        let explanation = engine(scorer, 64, None).explain(&fv, &score).unwrap();
        assert_eq!(explanation.factors.len(), 64);
        let total: f64 = explanation.factors.iter().map(|f| f.contribution).sum();
        assert!((total - (score.probability - explanation.baseline_probability)).abs() < 1e-6);
    }

    #[test]
    fn test_binomial() {
        assert_eq!(binomial(4, 0), 1.0);
        assert_eq!(binomial(4, 2), 6.0);
        assert_eq!(binomial(11, 5), 462.0);
    }
}
