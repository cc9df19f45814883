//! Outbox: the durable buffer between committed transactions and the
//! outside world.
//!
//! Notifications land in the outbox inside the same transaction as their
//! events and leave it when a consumer acknowledges them. Delivery is
//! at-least-once: a consumer that crashes between publishing and
//! acknowledging sees the same items again, with identical `seq_nr` and
//! `correlation_id`, so downstream deduplication has stable keys to work
//! with.

use crate::errors::JournalResult;
use crate::types::{CommandId, SeqNr, StreamId, Timestamp};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// A pending notification as stored in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem<N> {
    /// Global commit-order position; stable across redeliveries.
    pub seq_nr: SeqNr,
    /// The stream whose commit produced this notification.
    pub stream_id: StreamId,
    /// The command that caused the commit; stable across redeliveries.
    pub correlation_id: CommandId,
    /// The notification payload.
    pub notification: N,
    /// When the producing transaction committed.
    pub created_at: Timestamp,
}

/// Read side of the outbox.
#[async_trait]
pub trait OutboxReader: Send + Sync {
    /// Notification type stored in this outbox.
    type Notification: Send + Sync;

    /// Pending items in `seq_nr` order: an initial scan of everything
    /// unacknowledged, then a long wait that wakes as new commits land.
    ///
    /// The stream is pull-based; unconsumed items stay in the store, not in
    /// memory. Dropping the stream and calling `read` again redelivers
    /// everything still unacknowledged.
    fn read(&self) -> BoxStream<'static, JournalResult<OutboxItem<Self::Notification>>>;

    /// Durably acknowledges the given items; exactly their `seq_nr` values
    /// become invisible to future reads.
    async fn mark_all_as_sent(
        &self,
        items: &[OutboxItem<Self::Notification>],
    ) -> JournalResult<()>;
}

/// Failure reported by a [`NotificationPublisher`].
#[derive(Debug, Error)]
#[error("notification publish failed: {0}")]
pub struct PublishError(pub String);

/// Destination for drained outbox batches: a message bus, a webhook, a
/// projector.
#[async_trait]
pub trait NotificationPublisher<N>: Send + Sync {
    /// Delivers one batch. Returning an error leaves the batch
    /// unacknowledged; it will be delivered again.
    async fn publish(&self, batch: &[OutboxItem<N>]) -> Result<(), PublishError>;
}

/// Drain loop turning the outbox into an at-least-once outbound stream.
///
/// Batches of ready items are handed to the publisher; only after a batch is
/// published successfully is it marked as sent. A failed publish restarts
/// the read after a delay, redelivering the unacknowledged tail.
pub struct OutboxProcessor<O, P> {
    reader: O,
    publisher: P,
    batch_size: usize,
    retry_delay: Duration,
}

impl<O, P, N> OutboxProcessor<O, P>
where
    O: OutboxReader<Notification = N>,
    P: NotificationPublisher<N>,
    N: Clone + Send + Sync + 'static,
{
    /// Creates a processor with a batch size of 64 and a one second retry
    /// delay.
    pub fn new(reader: O, publisher: P) -> Self {
        Self {
            reader,
            publisher,
            batch_size: 64,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Sets the maximum number of items handed to the publisher at once.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the pause before re-reading after a failed publish.
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Runs until `stop` flips to `true` or the store reports a transport
    /// failure.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> JournalResult<()> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            let mut batches = self.reader.read().ready_chunks(self.batch_size);
            loop {
                let chunk = tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return Ok(());
                        }
                        continue;
                    }
                    chunk = batches.next() => match chunk {
                        Some(chunk) => chunk,
                        None => return Ok(()),
                    },
                };
                let mut items = Vec::with_capacity(chunk.len());
                for entry in chunk {
                    items.push(entry?);
                }
                if items.is_empty() {
                    continue;
                }
                match self.publisher.publish(&items).await {
                    Ok(()) => {
                        self.reader.mark_all_as_sent(&items).await?;
                        debug!(batch = items.len(), "outbox batch acknowledged");
                    }
                    Err(error) => {
                        warn!(error = %error, batch = items.len(), "publish failed, will redeliver");
                        tokio::time::sleep(self.retry_delay).await;
                        break;
                    }
                }
            }
        }
    }
}

impl<N> OutboxItem<N> {
    /// Creates an item at the given outbox coordinates.
    pub fn new(
        seq_nr: SeqNr,
        stream_id: StreamId,
        correlation_id: CommandId,
        notification: N,
        created_at: Timestamp,
    ) -> Self {
        Self {
            seq_nr,
            stream_id,
            correlation_id,
            notification,
            created_at,
        }
    }
}
