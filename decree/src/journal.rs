//! Journal ports: the append-only event log the runtime reads and writes.
//!
//! These traits are implemented by storage drivers (`decree-memory` ships
//! one; SQL drivers follow the same contract). The crucial obligation is on
//! [`JournalWriter::append`]: the events, the outbox batch, and the
//! command-id record of one commit land in a single transaction, and the
//! stream-change notification is published once that transaction is durable.

use crate::errors::JournalResult;
use crate::message::EventMessage;
use crate::types::{CommandId, EventVersion, NonEmptyVec, SeqNr, StreamId, Timestamp};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A stream of journal events; each item is a read result so transport
/// failures surface in-band.
pub type EventStream<E> = BoxStream<'static, JournalResult<EventMessage<E>>>;

/// One commit: events to append plus the side records that must land with
/// them.
#[derive(Debug, Clone)]
pub struct AppendRequest<E, N> {
    /// The stream being appended to.
    pub stream_id: StreamId,
    /// Commit wall-clock time, stamped by the handler.
    pub time: Timestamp,
    /// The version the stream must currently be at; mismatch fails the
    /// commit with a version conflict.
    pub expected_version: EventVersion,
    /// Events to append, in order, at `expected_version + 1 ...`.
    pub events: NonEmptyVec<E>,
    /// Outbox batch committed atomically with the events. May be empty.
    pub notifications: Vec<N>,
    /// The causing command; recorded for idempotency in the same
    /// transaction.
    pub command_id: CommandId,
}

/// An outbox-only commit, for decisions that publish without appending.
#[derive(Debug, Clone)]
pub struct NotifyRequest<N> {
    /// The stream the notifications relate to.
    pub stream_id: StreamId,
    /// The causing command; recorded for idempotency in the same
    /// transaction.
    pub command_id: CommandId,
    /// The outbox batch.
    pub notifications: NonEmptyVec<N>,
}

/// Write side of the journal.
#[async_trait]
pub trait JournalWriter: Send + Sync {
    /// Domain event type persisted by this journal.
    type Event: Send + Sync;
    /// Notification type persisted in the outbox.
    type Notification: Send + Sync;

    /// Commits events, their outbox batch, and the command-id record
    /// atomically, then publishes a change notification for the stream.
    ///
    /// # Errors
    ///
    /// - [`JournalError::VersionConflict`](crate::errors::JournalError::VersionConflict)
    ///   when `expected_version` no longer matches.
    /// - [`JournalError::DuplicateCommand`](crate::errors::JournalError::DuplicateCommand)
    ///   when a commit with the same command id already exists.
    /// - Transport variants for storage failures.
    async fn append(
        &self,
        request: AppendRequest<Self::Event, Self::Notification>,
    ) -> JournalResult<()>;

    /// Commits an outbox batch without journal events, recording the command
    /// id in the same transaction.
    async fn notify(&self, request: NotifyRequest<Self::Notification>) -> JournalResult<()>;
}

/// Read side of the journal.
///
/// Every reader returns a fresh, restartable stream; dropping a stream and
/// calling again re-reads from the requested position.
pub trait JournalReader: Send + Sync {
    /// Domain event type read from this journal.
    type Event: Send + Sync;

    /// All events of one stream, in version order.
    fn read_stream(&self, stream_id: &StreamId) -> EventStream<Self::Event>;

    /// Events of one stream with `version > after`.
    fn read_stream_after(
        &self,
        stream_id: &StreamId,
        after: EventVersion,
    ) -> EventStream<Self::Event>;

    /// Events of one stream with `version < before`.
    fn read_stream_before(
        &self,
        stream_id: &StreamId,
        before: EventVersion,
    ) -> EventStream<Self::Event>;

    /// All events across all streams, in global `seq_nr` order.
    fn read_all(&self) -> EventStream<Self::Event>;

    /// All events with `seq_nr > after`, in global order.
    fn read_all_after(&self, after: SeqNr) -> EventStream<Self::Event>;

    /// Per-stream change feed: yields the id of each stream as commits land.
    fn notifications(&self) -> BoxStream<'static, StreamId>;
}
