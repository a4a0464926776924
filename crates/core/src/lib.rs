pub mod config;
pub mod dead_letter;
pub mod error;
pub mod features;
pub mod inference;
pub mod partition;
pub mod sink;
pub mod source;
pub mod types;

pub use config::AppConfig;
pub use error::{ChurnError, ChurnResult};
pub use inference::{Imputation, ScoringError, ScoringModel};
pub use partition::partition_for;
