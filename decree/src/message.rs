//! Message envelopes: events as stored in the journal and commands as
//! submitted by callers.

use crate::types::{CommandId, EventId, EventVersion, SeqNr, StreamId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Journal-assigned metadata of a stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Globally unique event id (UUIDv7).
    pub id: EventId,
    /// When the event was committed.
    pub time: Timestamp,
    /// Global commit-order sequence number.
    pub seq_nr: SeqNr,
    /// Position within the event's stream, contiguous from 1.
    pub version: EventVersion,
    /// The stream the event belongs to.
    pub stream_id: StreamId,
}

impl EventMetadata {
    /// Creates metadata for an event at the given journal coordinates.
    pub fn new(
        id: EventId,
        time: Timestamp,
        seq_nr: SeqNr,
        version: EventVersion,
        stream_id: StreamId,
    ) -> Self {
        Self {
            id,
            time,
            seq_nr,
            version,
            stream_id,
        }
    }
}

/// An event as read from the journal: payload plus journal coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage<E> {
    /// Journal-assigned metadata.
    pub metadata: EventMetadata,
    /// The domain event itself.
    pub payload: E,
}

impl<E> EventMessage<E> {
    /// Pairs a payload with its metadata.
    pub const fn new(metadata: EventMetadata, payload: E) -> Self {
        Self { metadata, payload }
    }

    /// Maps the payload, keeping the metadata.
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> EventMessage<F> {
        EventMessage {
            metadata: self.metadata,
            payload: f(self.payload),
        }
    }
}

/// A command addressed to a single stream.
///
/// The `id` is the idempotency key: submitting the same id twice has the
/// effect of submitting it once. `metadata` carries caller context (trace
/// ids, user ids) opaque to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage<C> {
    /// Idempotency key, minted by the caller.
    pub id: CommandId,
    /// When the caller created the command.
    pub time: Timestamp,
    /// The target stream.
    pub address: StreamId,
    /// The domain command itself.
    pub payload: C,
    /// Caller-supplied context, opaque to the runtime.
    pub metadata: HashMap<String, String>,
}

impl<C> CommandMessage<C> {
    /// Creates a command stamped with the current time and empty metadata.
    pub fn new(id: CommandId, address: StreamId, payload: C) -> Self {
        Self {
            id,
            time: Timestamp::now(),
            address,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
