#![warn(clippy::unwrap_used)]

pub mod checkpoint;
pub mod features;
pub mod local;

pub use checkpoint::{InMemoryCheckpointStore, RedisCheckpointStore};
pub use features::CachedFeatureStore;
pub use local::LocalCache;
