pub mod batcher;
pub mod manager;
pub mod processor;
pub mod publisher;
pub mod source;
pub mod status;
pub mod worker;

pub use batcher::TriggerPolicy;
pub use manager::{PartitionManager, PipelineDeps};
pub use processor::WindowProcessor;
pub use publisher::{EventPublisher, PublishSummary};
pub use source::{MemoryEventSource, NatsEventSource};
pub use status::{PartitionState, PartitionStatus, StatusRegistry};
pub use worker::{CycleReport, PartitionWorker};
