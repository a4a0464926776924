pub mod clickhouse;
pub mod features;
pub mod memory;
pub mod retry;
pub mod writer;

pub use self::clickhouse::ClickHousePredictionSink;
pub use features::ClickHouseFeatureStore;
pub use memory::InMemoryPredictionSink;
pub use retry::RetryPolicy;
pub use writer::{PredictionWriter, RetryQueue, WriteOutcome};
