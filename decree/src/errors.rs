//! Error types for the decree runtime.
//!
//! The taxonomy separates infrastructure failures (effects) from business
//! rejections (values). Rejections never appear here: they travel as the
//! `Err` side of a command outcome, typed by the domain model. Only
//! [`JournalError::VersionConflict`] crosses between the two worlds, as the
//! retry control signal of the command handler.

use crate::types::{CommandId, EventVersion, StreamId};
use thiserror::Error;

/// Errors raised by the journal, outbox, and snapshot storage layer.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Optimistic concurrency check failed: another writer committed to the
    /// stream between load and append.
    #[error(
        "version conflict on stream '{stream}': expected {expected}, but current is {current}"
    )]
    VersionConflict {
        /// The stream with the conflicting write.
        stream: StreamId,
        /// The version the writer expected the stream to be at.
        expected: EventVersion,
        /// The version the stream was actually at.
        current: EventVersion,
    },

    /// A commit tagged with this command id already exists.
    ///
    /// Drivers enforce this with a unique index on the command id; the
    /// handler treats it as proof the command was already processed.
    #[error("command '{0}' was already processed")]
    DuplicateCommand(CommandId),

    /// The requested stream does not exist.
    #[error("stream '{0}' not found")]
    StreamNotFound(StreamId),

    /// The connection to the store failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Encoding or decoding a payload failed.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// An I/O error occurred.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised by the command handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Every retry attempt observed a version conflict.
    #[error("version conflict on stream '{stream}' persisted after {attempts} attempts")]
    RetriesExhausted {
        /// The contended stream.
        stream: StreamId,
        /// Total number of attempts made, including the first.
        attempts: u32,
    },

    /// A storage failure that is not retried by the handler.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
}

/// Result alias for storage operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Result alias for handler operations.
pub type HandlerResult<T> = Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_message_names_both_versions() {
        let err = JournalError::VersionConflict {
            stream: StreamId::try_new("account-1").unwrap(),
            expected: EventVersion::try_new(3).unwrap(),
            current: EventVersion::try_new(5).unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "version conflict on stream 'account-1': expected 3, but current is 5"
        );
    }

    #[test]
    fn handler_error_wraps_journal_error() {
        let journal = JournalError::ConnectionFailed("refused".to_string());
        let handler: HandlerError = journal.into();
        assert!(matches!(
            handler,
            HandlerError::Journal(JournalError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn retries_exhausted_message_counts_attempts() {
        let err = HandlerError::RetriesExhausted {
            stream: StreamId::try_new("account-1").unwrap(),
            attempts: 6,
        };
        assert!(err.to_string().contains("after 6 attempts"));
    }

    #[test]
    fn io_errors_convert_into_journal_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: JournalError = io.into();
        assert!(matches!(err, JournalError::Io(_)));
    }
}
