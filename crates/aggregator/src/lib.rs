//! Windowed feature aggregation: per-entity incremental state over an
//! unbounded event stream, snapshotted into feature vectors.

pub mod aggregator;
pub mod state;
pub mod window;

pub use aggregator::{
    AggregatorSnapshot, AggregatorStats, ApplyOutcome, PartitionAggregator, TimelineSnapshot,
};
pub use state::{Accumulator, EntityState};
pub use window::WindowAssigner;
