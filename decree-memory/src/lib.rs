//! In-memory storage driver for the decree runtime.
//!
//! Implements every port a backend needs (journal reader and writer,
//! outbox reader, snapshot persistence, and the commit wake-up feed) on
//! top of a single mutex-guarded state. One lock per commit is what makes
//! the atomicity contract trivially true here: events, the outbox batch,
//! and the command-id record become visible together or not at all.
//!
//! Intended for tests and development. Cloning the driver shares storage,
//! so handing clones to a backend, an outbox processor, and a test
//! assertion block all observe the same journal.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use decree::journal::{AppendRequest, EventStream, JournalReader, JournalWriter, NotifyRequest};
use decree::notifications::NotificationsConsumer;
use decree::outbox::{OutboxItem, OutboxReader};
use decree::snapshot::{SnapshotPersistence, VersionedState};
use decree::{
    CommandId, EventId, EventMessage, EventMetadata, EventVersion, JournalError, JournalResult,
    SeqNr, StreamId, Timestamp,
};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

struct PendingItem<N> {
    item: OutboxItem<N>,
    consumed: bool,
}

struct Inner<E, N, S> {
    streams: HashMap<StreamId, Vec<EventMessage<E>>>,
    log: Vec<EventMessage<E>>,
    seq: SeqNr,
    outbox: Vec<PendingItem<N>>,
    commands: HashSet<CommandId>,
    snapshots: HashMap<StreamId, VersionedState<S>>,
}

impl<E, N, S> Default for Inner<E, N, S> {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            log: Vec::new(),
            seq: SeqNr::initial(),
            outbox: Vec::new(),
            commands: HashSet::new(),
            snapshots: HashMap::new(),
        }
    }
}

/// Thread-safe in-memory driver; clones share storage.
pub struct InMemoryDriver<E, N, S> {
    inner: Arc<Mutex<Inner<E, N, S>>>,
    changes: broadcast::Sender<StreamId>,
    ticks: broadcast::Sender<()>,
}

impl<E, N, S> Clone for InMemoryDriver<E, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            changes: self.changes.clone(),
            ticks: self.ticks.clone(),
        }
    }
}

impl<E, N, S> InMemoryDriver<E, N, S> {
    /// Creates an empty driver.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        let (ticks, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes,
            ticks,
        }
    }
}

impl<E, N, S> Default for InMemoryDriver<E, N, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, N, S> InMemoryDriver<E, N, S>
where
    E: Clone + Send + Sync + 'static,
    N: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<E, N, S>> {
        self.inner.lock().expect("driver state lock poisoned")
    }

    /// Number of events across all streams. Test helper.
    pub fn event_count(&self) -> usize {
        self.lock().log.len()
    }

    /// Number of unconsumed outbox items. Test helper.
    pub fn pending_outbox_count(&self) -> usize {
        self.lock().outbox.iter().filter(|p| !p.consumed).count()
    }

    /// Appends events outside any command flow, bypassing the command-id
    /// record. Intended for seeding test journals (including poison events
    /// a model refuses to fold).
    pub fn inject_events(
        &self,
        stream_id: &StreamId,
        events: impl IntoIterator<Item = E>,
    ) -> JournalResult<()> {
        let mut inner = self.lock();
        let mut version = current_version(&inner, stream_id);
        let mut seq = inner.seq;
        let time = Timestamp::now();
        let mut appended = Vec::new();
        for payload in events {
            seq = seq.next();
            version = version.next();
            appended.push(EventMessage::new(
                EventMetadata::new(EventId::new(), time, seq, version, stream_id.clone()),
                payload,
            ));
        }
        inner.seq = seq;
        inner.log.extend(appended.iter().cloned());
        inner
            .streams
            .entry(stream_id.clone())
            .or_default()
            .extend(appended);
        drop(inner);
        let _ = self.changes.send(stream_id.clone());
        let _ = self.ticks.send(());
        Ok(())
    }

    fn filtered_events(
        &self,
        predicate: impl Fn(&EventMessage<E>) -> bool,
    ) -> EventStream<E> {
        let matching: Vec<JournalResult<EventMessage<E>>> = self
            .lock()
            .log
            .iter()
            .filter(|event| predicate(event))
            .cloned()
            .map(Ok)
            .collect();
        stream::iter(matching).boxed()
    }
}

fn current_version<E, N, S>(inner: &Inner<E, N, S>, stream_id: &StreamId) -> EventVersion {
    inner
        .streams
        .get(stream_id)
        .and_then(|events| events.last())
        .map_or_else(EventVersion::initial, |event| event.metadata.version)
}

#[async_trait]
impl<E, N, S> JournalWriter for InMemoryDriver<E, N, S>
where
    E: Clone + Send + Sync + 'static,
    N: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    type Event = E;
    type Notification = N;

    async fn append(&self, request: AppendRequest<E, N>) -> JournalResult<()> {
        let stream_id = request.stream_id.clone();
        {
            let mut inner = self.lock();
            if inner.commands.contains(&request.command_id) {
                return Err(JournalError::DuplicateCommand(request.command_id));
            }
            let current = current_version(&inner, &stream_id);
            if current != request.expected_version {
                return Err(JournalError::VersionConflict {
                    stream: stream_id,
                    expected: request.expected_version,
                    current,
                });
            }

            // Single critical section: events, outbox batch, and command-id
            // record become visible together.
            let mut seq = inner.seq;
            let mut version = current;
            let mut appended = Vec::with_capacity(request.events.len());
            for payload in request.events {
                seq = seq.next();
                version = version.next();
                appended.push(EventMessage::new(
                    EventMetadata::new(
                        EventId::new(),
                        request.time,
                        seq,
                        version,
                        stream_id.clone(),
                    ),
                    payload,
                ));
            }
            for notification in request.notifications {
                seq = seq.next();
                inner.outbox.push(PendingItem {
                    item: OutboxItem::new(
                        seq,
                        stream_id.clone(),
                        request.command_id,
                        notification,
                        request.time,
                    ),
                    consumed: false,
                });
            }
            inner.seq = seq;
            inner.log.extend(appended.iter().cloned());
            inner
                .streams
                .entry(stream_id.clone())
                .or_default()
                .extend(appended);
            inner.commands.insert(request.command_id);
        }
        debug!(stream_id = %stream_id, "commit applied");
        let _ = self.changes.send(stream_id);
        let _ = self.ticks.send(());
        Ok(())
    }

    async fn notify(&self, request: NotifyRequest<N>) -> JournalResult<()> {
        {
            let mut inner = self.lock();
            if inner.commands.contains(&request.command_id) {
                return Err(JournalError::DuplicateCommand(request.command_id));
            }
            let mut seq = inner.seq;
            let time = Timestamp::now();
            for notification in request.notifications {
                seq = seq.next();
                inner.outbox.push(PendingItem {
                    item: OutboxItem::new(
                        seq,
                        request.stream_id.clone(),
                        request.command_id,
                        notification,
                        time,
                    ),
                    consumed: false,
                });
            }
            inner.seq = seq;
            inner.commands.insert(request.command_id);
        }
        let _ = self.ticks.send(());
        Ok(())
    }
}

impl<E, N, S> JournalReader for InMemoryDriver<E, N, S>
where
    E: Clone + Send + Sync + 'static,
    N: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    type Event = E;

    fn read_stream(&self, stream_id: &StreamId) -> EventStream<E> {
        let stream_id = stream_id.clone();
        self.filtered_events(move |event| event.metadata.stream_id == stream_id)
    }

    fn read_stream_after(&self, stream_id: &StreamId, after: EventVersion) -> EventStream<E> {
        let stream_id = stream_id.clone();
        self.filtered_events(move |event| {
            event.metadata.stream_id == stream_id && event.metadata.version > after
        })
    }

    fn read_stream_before(&self, stream_id: &StreamId, before: EventVersion) -> EventStream<E> {
        let stream_id = stream_id.clone();
        self.filtered_events(move |event| {
            event.metadata.stream_id == stream_id && event.metadata.version < before
        })
    }

    fn read_all(&self) -> EventStream<E> {
        self.filtered_events(|_| true)
    }

    fn read_all_after(&self, after: SeqNr) -> EventStream<E> {
        self.filtered_events(move |event| event.metadata.seq_nr > after)
    }

    fn notifications(&self) -> BoxStream<'static, StreamId> {
        BroadcastStream::new(self.changes.subscribe())
            .filter_map(|result| async move {
                // Lagged receivers skip coalesced notifications; consumers
                // re-read their source of truth anyway.
                result.ok()
            })
            .boxed()
    }
}

#[async_trait]
impl<E, N, S> OutboxReader for InMemoryDriver<E, N, S>
where
    E: Clone + Send + Sync + 'static,
    N: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    type Notification = N;

    fn read(&self) -> BoxStream<'static, JournalResult<OutboxItem<N>>> {
        let driver = self.clone();
        let wakeups = self.ticks.subscribe();
        let cursor = SeqNr::initial();
        Box::pin(stream::unfold(
            (driver, wakeups, cursor),
            |(driver, mut wakeups, cursor)| async move {
                loop {
                    let next = {
                        let inner = driver.lock();
                        inner
                            .outbox
                            .iter()
                            .filter(|pending| !pending.consumed && pending.item.seq_nr > cursor)
                            .map(|pending| pending.item.clone())
                            .next()
                    };
                    if let Some(item) = next {
                        let cursor = item.seq_nr;
                        return Some((Ok(item), (driver, wakeups, cursor)));
                    }
                    match wakeups.recv().await {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        ))
    }

    async fn mark_all_as_sent(&self, items: &[OutboxItem<N>]) -> JournalResult<()> {
        let acknowledged: HashSet<SeqNr> = items.iter().map(|item| item.seq_nr).collect();
        let mut inner = self.lock();
        for pending in &mut inner.outbox {
            if acknowledged.contains(&pending.item.seq_nr) {
                pending.consumed = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<E, N, S> SnapshotPersistence for InMemoryDriver<E, N, S>
where
    E: Clone + Send + Sync + 'static,
    N: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    type State = S;

    async fn load(&self, stream_id: &StreamId) -> JournalResult<Option<VersionedState<S>>> {
        Ok(self.lock().snapshots.get(stream_id).cloned())
    }

    async fn save(&self, stream_id: &StreamId, state: &VersionedState<S>) -> JournalResult<()> {
        self.lock()
            .snapshots
            .insert(stream_id.clone(), state.clone());
        Ok(())
    }
}

impl<E, N, S> NotificationsConsumer for InMemoryDriver<E, N, S>
where
    E: Clone + Send + Sync + 'static,
    N: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    fn listen(&self) -> BoxStream<'static, ()> {
        BroadcastStream::new(self.ticks.subscribe())
            .filter_map(|result| async move { result.ok() })
            .boxed()
    }
}
