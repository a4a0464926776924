//! Window processor: scores and explains closed feature vectors off the
//! async runtime, each call bounded by the configured deadline.

use churn_core::inference::ScoringError;
use churn_core::types::{FeatureVector, Score};
use churn_model::{ExplainabilityEngine, Explanation, ModelScorer};
use std::sync::Arc;
use std::time::Duration;

pub struct WindowProcessor {
    scorer: Arc<ModelScorer>,
    explainer: Arc<ExplainabilityEngine>,
    timeout: Duration,
}

impl WindowProcessor {
    pub fn new(
        scorer: Arc<ModelScorer>,
        explainer: Arc<ExplainabilityEngine>,
        timeout: Duration,
    ) -> Self {
        Self {
            scorer,
            explainer,
            timeout,
        }
    }

    pub fn scorer(&self) -> &Arc<ModelScorer> {
        &self.scorer
    }

    pub async fn score(&self, vector: &FeatureVector) -> Result<Score, ScoringError> {
        let scorer = self.scorer.clone();
        let fv = vector.clone();
        self.bounded("score", vector, move || scorer.score(&fv))
            .await
    }

    pub async fn explain(
        &self,
        vector: &FeatureVector,
        score: &Score,
    ) -> Result<Explanation, ScoringError> {
        let explainer = self.explainer.clone();
        let fv = vector.clone();
        let score = score.clone();
        self.bounded("explain", vector, move || explainer.explain(&fv, &score))
            .await
    }

    async fn bounded<T, F>(
        &self,
        stage: &str,
        vector: &FeatureVector,
        work: F,
    ) -> Result<T, ScoringError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ScoringError> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(work)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ScoringError::InvalidOutput(format!(
                "{stage} task for {}/{} aborted: {join}",
                vector.entity_id, vector.window_id
            ))),
            Err(_) => Err(ScoringError::Timeout(format!(
                "{stage} of {}/{} exceeded {}ms",
                vector.entity_id,
                vector.window_id,
                self.timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use churn_core::config::ExplainConfig;
    use churn_core::inference::{Imputation, ScoringModel};
    use churn_core::types::{Prediction, WindowId};
    use chrono::Utc;
    use std::collections::BTreeMap;

    struct SlowModel;

    impl ScoringModel for SlowModel {
        fn version(&self) -> &str {
            "slow"
        }
        fn feature_names(&self) -> Vec<String> {
            vec!["x".into()]
        }
        fn imputation(&self, _feature: &str) -> Imputation {
            Imputation::Default(0.0)
        }
        fn reference(&self) -> BTreeMap<String, f64> {
            BTreeMap::from([("x".to_string(), 0.0)])
        }
        fn predict_proba(&self, _inputs: &BTreeMap<String, f64>) -> Result<f64, ScoringError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(0.5)
        }
    }

    fn processor(model: Arc<dyn ScoringModel>, timeout: Duration) -> WindowProcessor {
        let scorer = Arc::new(ModelScorer::new(model, None));
        let explainer = Arc::new(ExplainabilityEngine::new(
            scorer.clone(),
            ExplainConfig::default(),
        ));
        WindowProcessor::new(scorer, explainer, timeout)
    }

    fn vector() -> FeatureVector {
        FeatureVector {
            entity_id: "C1".into(),
            window_id: WindowId(10),
            as_of_time: Utc::now(),
            features: BTreeMap::from([
                ("tenure".to_string(), 5.0),
                ("is_mtm".to_string(), 1.0),
                ("tickets_30d".to_string(), 2.0),
            ]),
        }
    }

    #[tokio::test]
    async fn test_score_then_explain_builds_prediction() {
        let model = churn_model::LogisticModel::from_artifact(churn_model::ModelArtifact::builtin())
            .unwrap();
        let processor = processor(Arc::new(model), Duration::from_secs(5));
        let vector = vector();
        let score = processor.score(&vector).await.unwrap();
        let explanation = processor.explain(&vector, &score).await.unwrap();
        let prediction = Prediction::new(&vector, &score, explanation.factors, Utc::now());
        assert_eq!(prediction.entity_id, "C1");
        assert_eq!(prediction.window_id, WindowId(10));
        assert_eq!(prediction.churn_flag, 1);
        assert_eq!(prediction.risk_factors[0].feature, "is_mtm");
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        let processor = processor(Arc::new(SlowModel), Duration::from_millis(20));
        let err = processor.score(&vector()).await.unwrap_err();
        assert!(matches!(err, ScoringError::Timeout(_)), "{err}");
    }
}
