//! Producer side of the event transport: routes events to their entity's
//! partition subject. Used by the `publish` command to replay event files.

use async_nats::jetstream;
use churn_core::config::NatsConfig;
use churn_core::error::{ChurnError, ChurnResult};
use churn_core::partition_for;
use churn_core::types::{Event, PartitionId};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::source::subject;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    pub published: u64,
    pub skipped: u64,
}

pub struct EventPublisher {
    jetstream: jetstream::Context,
    subject_prefix: String,
    partition_count: u32,
}

impl EventPublisher {
    pub fn new(jetstream: jetstream::Context, config: &NatsConfig, partition_count: u32) -> Self {
        Self {
            jetstream,
            subject_prefix: config.subject_prefix.clone(),
            partition_count,
        }
    }

    /// Publish one event and wait for the stream to persist it.
    pub async fn publish(&self, event: &Event) -> ChurnResult<PartitionId> {
        let partition = partition_for(&event.entity_id, self.partition_count);
        let payload = event.to_wire()?;
        self.jetstream
            .publish(subject(&self.subject_prefix, partition), payload.into())
            .await
            .map_err(|e| ChurnError::Transport(format!("publish: {e}")))?
            .await
            .map_err(|e| ChurnError::Transport(format!("publish ack: {e}")))?;
        metrics::counter!("publisher.events").increment(1);
        Ok(partition)
    }

    /// Publish newline-delimited JSON events. Unparseable lines are skipped.
    pub async fn publish_lines<R>(&self, reader: R) -> ChurnResult<PublishSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut summary = PublishSummary::default();
        let mut lines = reader.lines();
        let mut line_no = 0u64;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ChurnError::Internal(e.into()))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match Event::from_slice(line.as_bytes()) {
                Ok(event) => {
                    self.publish(&event).await?;
                    summary.published += 1;
                }
                Err(e) => {
                    warn!(line = line_no, error = %e, "Skipping unparseable event");
                    summary.skipped += 1;
                }
            }
        }
        info!(
            published = summary.published,
            skipped = summary.skipped,
            "Event file published"
        );
        Ok(summary)
    }
}
