pub mod engine;
pub mod explain;
pub mod model;

pub use engine::{impute, ModelScorer};
pub use explain::{ExplainabilityEngine, Explanation};
pub use model::{FeatureWeight, LogisticModel, ModelArtifact};
