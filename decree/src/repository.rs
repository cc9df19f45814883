//! Materialising aggregate state from snapshots and the journal tail.

use crate::errors::JournalResult;
use crate::journal::JournalReader;
use crate::message::EventMessage;
use crate::model::Model;
use crate::snapshot::{SnapshotStore, VersionedState};
use crate::types::{EventVersion, NonEmptyVec, StreamId};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tracing::instrument;

/// The current state of an aggregate, as reconstructed from its stream.
///
/// `Conflicted` captures a fold failure: an event in the journal that the
/// model refuses to apply. The state stops advancing at the last good value,
/// the offending event and the fold errors are kept, and every later event
/// of the stream is ignored. A conflicted aggregate rejects all commands
/// until the conflict is resolved out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateState<S, E, R> {
    /// All events up to `version` applied cleanly.
    Valid(VersionedState<S>),
    /// Folding failed on `on_event`; `last` is the state just before it.
    Conflicted {
        /// The last cleanly folded state.
        last: S,
        /// The event that failed to apply.
        on_event: EventMessage<E>,
        /// Why the event failed to apply.
        errors: NonEmptyVec<R>,
    },
}

impl<S, E, R> AggregateState<S, E, R> {
    /// True when all events applied cleanly.
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// The valid payload, if any.
    pub const fn as_valid(&self) -> Option<&VersionedState<S>> {
        match self {
            Self::Valid(state) => Some(state),
            Self::Conflicted { .. } => None,
        }
    }
}

/// Reconstructs aggregate state: snapshot first, then the journal tail.
pub struct Repository<M: Model, J> {
    model: Arc<M>,
    journal: J,
    snapshots: Arc<dyn SnapshotStore<State = M::State>>,
}

impl<M: Model, J: Clone> Clone for Repository<M, J> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            journal: self.journal.clone(),
            snapshots: Arc::clone(&self.snapshots),
        }
    }
}

impl<M, J> Repository<M, J>
where
    M: Model,
    J: JournalReader<Event = M::Event>,
{
    /// Creates a repository over a journal reader and a snapshot store.
    pub fn new(
        model: Arc<M>,
        journal: J,
        snapshots: Arc<dyn SnapshotStore<State = M::State>>,
    ) -> Self {
        Self {
            model,
            journal,
            snapshots,
        }
    }

    /// The model this repository folds with.
    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    /// Returns the current aggregate state of a stream.
    ///
    /// Starts from a cached snapshot when one exists, folds the journal tail
    /// over it, and writes the result back to the snapshot store
    /// (best-effort) when the fold advanced. Transport errors from the
    /// journal propagate unchanged; fold errors produce `Conflicted`, never
    /// an `Err`.
    #[instrument(skip(self), fields(stream_id = %stream_id))]
    pub async fn get(
        &self,
        stream_id: &StreamId,
    ) -> JournalResult<AggregateState<M::State, M::Event, M::Rejection>> {
        let start = match self.snapshots.get(stream_id).await {
            Some(cached) => cached,
            None => VersionedState::new(self.model.initial(), EventVersion::initial()),
        };
        let from_version = start.version;

        let mut events = self.journal.read_stream_after(stream_id, from_version);
        let mut current = AggregateState::Valid(start);
        while let Some(item) = events.next().await {
            let event = item?;
            current = self.step(current, event);
            // Once conflicted the fold no longer advances, but the tail is
            // still consumed so the read terminates deterministically.
        }

        if let AggregateState::Valid(state) = &current {
            if state.version > from_version {
                self.snapshots.put(stream_id.clone(), state.clone()).await;
            }
        }
        Ok(current)
    }

    /// The state of the aggregate after each event, in order.
    ///
    /// Yields one element per event, always folding from the initial state
    /// (snapshots are not consulted), and ends after the first `Conflicted`
    /// element or at the end of the stream. Each call returns a fresh,
    /// restartable stream.
    pub fn history(
        &self,
        stream_id: &StreamId,
    ) -> BoxStream<'static, JournalResult<AggregateState<M::State, M::Event, M::Rejection>>> {
        let events = self.journal.read_stream(stream_id);
        let model = Arc::clone(&self.model);
        let seed = HistoryCursor {
            events,
            state: Some(VersionedState::new(model.initial(), EventVersion::initial())),
            model,
        };
        Box::pin(futures::stream::unfold(seed, |mut cursor| async move {
            let state = cursor.state.take()?;
            match cursor.events.next().await {
                None => None,
                Some(Err(error)) => {
                    // Transport failure: surface it and end; `state` was
                    // already taken so the stream is finished.
                    Some((Err(error), cursor))
                }
                Some(Ok(event)) => {
                    let next = match cursor.model.transition(&state.state, &event.payload) {
                        Ok(folded) => AggregateState::Valid(VersionedState::new(
                            folded,
                            event.metadata.version,
                        )),
                        Err(errors) => AggregateState::Conflicted {
                            last: state.state,
                            on_event: event,
                            errors,
                        },
                    };
                    if let AggregateState::Valid(valid) = &next {
                        cursor.state = Some(valid.clone());
                    }
                    Some((Ok(next), cursor))
                }
            }
        }))
    }

    fn step(
        &self,
        current: AggregateState<M::State, M::Event, M::Rejection>,
        event: EventMessage<M::Event>,
    ) -> AggregateState<M::State, M::Event, M::Rejection> {
        match current {
            AggregateState::Valid(state) => {
                match self.model.transition(&state.state, &event.payload) {
                    Ok(next) => AggregateState::Valid(VersionedState::new(
                        next,
                        event.metadata.version,
                    )),
                    Err(errors) => AggregateState::Conflicted {
                        last: state.state,
                        on_event: event,
                        errors,
                    },
                }
            }
            conflicted @ AggregateState::Conflicted { .. } => conflicted,
        }
    }
}

struct HistoryCursor<M: Model> {
    events: BoxStream<'static, JournalResult<EventMessage<M::Event>>>,
    state: Option<VersionedState<M::State>>,
    model: Arc<M>,
}
