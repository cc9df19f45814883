//! # decree
//!
//! An event-sourced command-handling runtime. Given a domain model (a pure
//! fold over events and a pure decider over commands), decree materialises
//! aggregate state from an append-only journal, applies commands
//! transactionally, commits resulting events atomically with their outbound
//! notifications, and exposes the notification stream to downstream
//! consumers through an at-least-once outbox.
//!
//! ## The shape of a command
//!
//! ```text
//! process(cmd)
//!   -> repository.get(stream)            // snapshot + journal tail fold
//!   -> model.decide(state, cmd)          // pure: Decision + notifications
//!   -> accepted?  atomic { append events; write outbox; record command id }
//!      rejected?  return reasons, write nothing
//!      conflict?  retry with exponential backoff
//! ```
//!
//! Writes serialize per stream through optimistic concurrency: the driver
//! checks the expected version at commit time, and the handler retries
//! conflicts. There are no application-level locks.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use decree::prelude::*;
//!
//! let backend = Backend::builder(AccountModel, driver).build();
//! let cmd = CommandMessage::new(CommandId::random(), stream_id, Deposit(100));
//! match backend.process(&cmd).await? {
//!     Ok(()) => { /* committed (or already processed) */ }
//!     Err(reasons) => { /* rejected by the model */ }
//! }
//! backend.shutdown().await;
//! ```
//!
//! Storage drivers implement the ports in [`journal`], [`outbox`],
//! [`snapshot`], and [`notifications`]; the `decree-memory` crate ships an
//! in-memory driver for tests and development.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod command_store;
pub mod decision;
pub mod errors;
pub mod handler;
pub mod journal;
pub mod message;
pub mod model;
pub mod notifications;
pub mod outbox;
pub mod repository;
pub mod response;
pub mod snapshot;
pub mod types;

pub use backend::{Backend, BackendBuilder, BackendConfig, StorageDriver};
pub use decision::Decision;
pub use errors::{HandlerError, HandlerResult, JournalError, JournalResult};
pub use handler::{CommandHandler, CommandOutcome, RetryConfig};
pub use message::{CommandMessage, EventMessage, EventMetadata};
pub use model::{Model, ModelResponse};
pub use repository::{AggregateState, Repository};
pub use response::Response;
pub use snapshot::{SnapshotConfig, VersionedState};
pub use types::{CommandId, EventId, EventVersion, NonEmptyVec, SeqNr, StreamId, Timestamp};

/// Convenience re-exports for implementing models and drivers.
pub mod prelude {
    pub use crate::backend::{Backend, BackendConfig, StorageDriver};
    pub use crate::decision::Decision;
    pub use crate::errors::{HandlerError, JournalError};
    pub use crate::handler::{CommandOutcome, RetryConfig};
    pub use crate::journal::{AppendRequest, JournalReader, JournalWriter, NotifyRequest};
    pub use crate::message::{CommandMessage, EventMessage, EventMetadata};
    pub use crate::model::{Model, ModelResponse};
    pub use crate::notifications::NotificationsConsumer;
    pub use crate::outbox::{NotificationPublisher, OutboxItem, OutboxProcessor, OutboxReader};
    pub use crate::repository::AggregateState;
    pub use crate::response::Response;
    pub use crate::snapshot::{SnapshotConfig, SnapshotPersistence, SnapshotStore, VersionedState};
    pub use crate::types::{
        CommandId, EventId, EventVersion, NonEmptyVec, SeqNr, StreamId, Timestamp,
    };
}
