//! Snapshot stores: caches of materialised aggregate state.
//!
//! A snapshot is `(state, version)` for a stream, a pure cache, always
//! rebuildable from the journal, so every failure path here degrades to a
//! cache miss rather than an error. Two flavours are provided: a plain
//! in-memory LRU, and a write-buffering LRU over a persistent backing store
//! that flushes dirty entries when enough accumulate or when the oldest has
//! waited long enough.

use crate::errors::JournalResult;
use crate::types::{EventVersion, StreamId};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Aggregate state at a known version: the payload of a valid aggregate and
/// the unit of snapshot storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedState<S> {
    /// The materialised state.
    pub state: S,
    /// How many events have been folded into `state`.
    pub version: EventVersion,
}

impl<S> VersionedState<S> {
    /// Pairs a state with its version.
    pub const fn new(state: S, version: EventVersion) -> Self {
        Self { state, version }
    }
}

/// Cache of `(stream id -> versioned state)`.
///
/// `get` and `put` never fail: internal problems are logged and surface as
/// misses. The journal remains the source of truth.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The aggregate state type cached by this store.
    type State: Send + Sync;

    /// Returns the freshest cached state for the stream, if any.
    async fn get(&self, stream_id: &StreamId) -> Option<VersionedState<Self::State>>;

    /// Caches the state for the stream, replacing anything older.
    async fn put(&self, stream_id: StreamId, state: VersionedState<Self::State>);
}

/// Durable backing for [`PersistedSnapshotStore`].
#[async_trait]
pub trait SnapshotPersistence: Send + Sync {
    /// The aggregate state type persisted by this store.
    type State: Send + Sync;

    /// Loads the persisted snapshot for the stream, if one exists.
    async fn load(&self, stream_id: &StreamId) -> JournalResult<Option<VersionedState<Self::State>>>;

    /// Persists the snapshot for the stream, replacing anything older.
    async fn save(
        &self,
        stream_id: &StreamId,
        state: &VersionedState<Self::State>,
    ) -> JournalResult<()>;
}

/// Tuning for snapshot caching and flushing.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Maximum number of snapshots held in memory.
    pub max_in_mem: usize,
    /// Number of dirty entries that triggers an immediate flush.
    pub max_buffer: usize,
    /// Maximum time a dirty entry may wait before being flushed.
    pub max_wait: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_in_mem: 1000,
            max_buffer: 100,
            max_wait: Duration::from_secs(60),
        }
    }
}

impl SnapshotConfig {
    fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_in_mem.max(1)).expect("capacity is clamped to at least 1")
    }
}

/// Fixed-capacity in-memory snapshot cache with LRU eviction.
pub struct InMemorySnapshotStore<S> {
    cache: Mutex<LruCache<StreamId, VersionedState<S>>>,
}

impl<S> InMemorySnapshotStore<S> {
    /// Creates a store holding at most `max_in_mem` snapshots.
    pub fn new(max_in_mem: usize) -> Self {
        let capacity =
            NonZeroUsize::new(max_in_mem.max(1)).expect("capacity is clamped to at least 1");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl<S> SnapshotStore for InMemorySnapshotStore<S>
where
    S: Clone + Send + Sync,
{
    type State = S;

    async fn get(&self, stream_id: &StreamId) -> Option<VersionedState<S>> {
        self.cache
            .lock()
            .expect("snapshot cache lock poisoned")
            .get(stream_id)
            .cloned()
    }

    async fn put(&self, stream_id: StreamId, state: VersionedState<S>) {
        self.cache
            .lock()
            .expect("snapshot cache lock poisoned")
            .put(stream_id, state);
    }
}

struct BufferedEntry<S> {
    value: VersionedState<S>,
    dirty: bool,
    dirty_since: Instant,
}

struct Buffer<S> {
    cache: LruCache<StreamId, BufferedEntry<S>>,
    dirty: usize,
}

impl<S: Clone> Buffer<S> {
    /// Snapshot of all dirty entries, latest version per stream.
    fn dirty_entries(&self) -> Vec<(StreamId, VersionedState<S>)> {
        self.cache
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(stream, entry)| (stream.clone(), entry.value.clone()))
            .collect()
    }

    fn oldest_dirty_age(&self, now: Instant) -> Option<Duration> {
        self.cache
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(_, entry)| now.saturating_duration_since(entry.dirty_since))
            .max()
    }

    /// Clears the dirty flag if the entry still holds the flushed version.
    fn mark_clean(&mut self, stream_id: &StreamId, version: EventVersion) {
        if let Some(entry) = self.cache.peek_mut(stream_id) {
            if entry.dirty && entry.value.version == version {
                entry.dirty = false;
                self.dirty -= 1;
            }
        }
    }
}

/// Write-buffering snapshot cache over a persistent backing store.
///
/// Reads always see the freshest in-memory value; cold misses fall through
/// to the backing store. Writes dirty the in-memory entry and are flushed in
/// the background: when `max_buffer` dirty entries accumulate, when the
/// oldest dirty entry reaches `max_wait`, or when a dirty entry is about to
/// be evicted. Flushing is coalesced per stream: only the latest version per
/// key is ever written.
pub struct PersistedSnapshotStore<P: SnapshotPersistence> {
    backing: P,
    buffer: Mutex<Buffer<P::State>>,
    config: SnapshotConfig,
    shutdown: watch::Sender<bool>,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<P> PersistedSnapshotStore<P>
where
    P: SnapshotPersistence + Send + Sync + 'static,
    P::State: Clone + Send + Sync + 'static,
{
    /// Creates the store and spawns its background flush timer; must be
    /// called from within a tokio runtime.
    ///
    /// The timer holds only a weak reference; dropping every strong `Arc`
    /// ends it. Call [`shutdown`](Self::shutdown) for a graceful final
    /// flush.
    pub fn new(backing: P, config: SnapshotConfig) -> Arc<Self> {
        let (shutdown, mut stopped) = watch::channel(false);
        let store = Arc::new(Self {
            backing,
            buffer: Mutex::new(Buffer {
                cache: LruCache::new(config.capacity()),
                dirty: 0,
            }),
            config,
            shutdown,
            flusher: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&store);
        let period = store.config.max_wait.min(Duration::from_secs(5)).max(Duration::from_millis(50));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            return;
                        }
                        continue;
                    }
                }
                let Some(store) = weak.upgrade() else { return };
                let overdue = {
                    let buffer = store.buffer.lock().expect("snapshot buffer lock poisoned");
                    buffer
                        .oldest_dirty_age(Instant::now())
                        .is_some_and(|age| age >= store.config.max_wait)
                };
                if overdue {
                    store.flush().await;
                }
            }
        });
        *store.flusher.lock().expect("snapshot flusher lock poisoned") = Some(handle);
        store
    }

    /// Writes every dirty entry to the backing store.
    ///
    /// Failures are logged and the entries stay dirty for the next cycle.
    /// Returns the number of entries flushed successfully.
    pub async fn flush(&self) -> usize {
        let pending = {
            let buffer = self.buffer.lock().expect("snapshot buffer lock poisoned");
            buffer.dirty_entries()
        };
        if pending.is_empty() {
            return 0;
        }
        let mut flushed = 0;
        for (stream_id, value) in pending {
            let version = value.version;
            match self.backing.save(&stream_id, &value).await {
                Ok(()) => {
                    let mut buffer = self.buffer.lock().expect("snapshot buffer lock poisoned");
                    buffer.mark_clean(&stream_id, version);
                    flushed += 1;
                }
                Err(error) => {
                    warn!(stream_id = %stream_id, error = %error, "snapshot flush failed");
                }
            }
        }
        debug!(flushed, "snapshot buffer flushed");
        flushed
    }

    /// Stops the flush timer and performs a final flush.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .flusher
            .lock()
            .expect("snapshot flusher lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush().await;
    }

    /// Inserts a dirty entry, returning a *different* dirty entry the LRU
    /// pushed out, which the caller must write through.
    fn record_put(
        &self,
        stream_id: StreamId,
        state: VersionedState<P::State>,
    ) -> Option<(StreamId, VersionedState<P::State>)> {
        let mut buffer = self.buffer.lock().expect("snapshot buffer lock poisoned");
        let replaced_dirty = buffer
            .cache
            .peek(&stream_id)
            .is_some_and(|entry| entry.dirty);
        if !replaced_dirty {
            buffer.dirty += 1;
        }
        let key = stream_id.clone();
        let previous = buffer.cache.push(
            stream_id,
            BufferedEntry {
                value: state,
                dirty: true,
                dirty_since: Instant::now(),
            },
        );
        match previous {
            // push returns the old value when the key already existed; that
            // is a replacement, not an eviction.
            Some((stream, entry)) if stream != key && entry.dirty => {
                buffer.dirty -= 1;
                Some((stream, entry.value))
            }
            _ => None,
        }
    }

    /// Caches a value loaded from the backing store, unless a fresher entry
    /// appeared meanwhile. Returns a dirty entry the LRU pushed out.
    fn cache_loaded(
        &self,
        stream_id: StreamId,
        state: VersionedState<P::State>,
    ) -> Option<(StreamId, VersionedState<P::State>)> {
        let mut buffer = self.buffer.lock().expect("snapshot buffer lock poisoned");
        if buffer.cache.contains(&stream_id) {
            return None;
        }
        let evicted = buffer.cache.push(
            stream_id,
            BufferedEntry {
                value: state,
                dirty: false,
                dirty_since: Instant::now(),
            },
        );
        match evicted {
            Some((stream, entry)) if entry.dirty => {
                buffer.dirty -= 1;
                Some((stream, entry.value))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl<P> SnapshotStore for PersistedSnapshotStore<P>
where
    P: SnapshotPersistence + Send + Sync + 'static,
    P::State: Clone + Send + Sync + 'static,
{
    type State = P::State;

    async fn get(&self, stream_id: &StreamId) -> Option<VersionedState<P::State>> {
        {
            let mut buffer = self.buffer.lock().expect("snapshot buffer lock poisoned");
            if let Some(entry) = buffer.cache.get(stream_id) {
                return Some(entry.value.clone());
            }
        }
        match self.backing.load(stream_id).await {
            Ok(Some(state)) => {
                if let Some((stream, value)) = self.cache_loaded(stream_id.clone(), state.clone()) {
                    if let Err(error) = self.backing.save(&stream, &value).await {
                        warn!(stream_id = %stream, error = %error, "flush of evicted snapshot failed");
                    }
                }
                Some(state)
            }
            Ok(None) => None,
            Err(error) => {
                warn!(stream_id = %stream_id, error = %error, "snapshot load failed, treating as miss");
                None
            }
        }
    }

    async fn put(&self, stream_id: StreamId, state: VersionedState<P::State>) {
        let evicted = self.record_put(stream_id, state);
        // A dirty entry pushed out by the LRU would be lost; write it now.
        if let Some((stream, value)) = evicted {
            if let Err(error) = self.backing.save(&stream, &value).await {
                warn!(stream_id = %stream, error = %error, "flush of evicted snapshot failed");
            }
        }
        let over_buffer = {
            let buffer = self.buffer.lock().expect("snapshot buffer lock poisoned");
            buffer.dirty >= self.config.max_buffer
        };
        if over_buffer {
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stream(name: &str) -> StreamId {
        StreamId::try_new(name).unwrap()
    }

    fn versioned(n: u64) -> VersionedState<u64> {
        VersionedState::new(n, EventVersion::try_new(n).unwrap())
    }

    #[derive(Default)]
    struct RecordingPersistence {
        saved: Mutex<HashMap<StreamId, VersionedState<u64>>>,
        saves: AtomicUsize,
        fail_saves: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl SnapshotPersistence for Arc<RecordingPersistence> {
        type State = u64;

        async fn load(&self, stream_id: &StreamId) -> JournalResult<Option<VersionedState<u64>>> {
            Ok(self.saved.lock().unwrap().get(stream_id).cloned())
        }

        async fn save(
            &self,
            stream_id: &StreamId,
            state: &VersionedState<u64>,
        ) -> JournalResult<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(crate::errors::JournalError::ConnectionFailed(
                    "save failure".to_string(),
                ));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.saved
                .lock()
                .unwrap()
                .insert(stream_id.clone(), state.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn in_memory_store_returns_what_was_put() {
        let store = InMemorySnapshotStore::new(10);
        store.put(stream("a"), versioned(3)).await;
        assert_eq!(store.get(&stream("a")).await, Some(versioned(3)));
        assert_eq!(store.get(&stream("b")).await, None);
    }

    #[tokio::test]
    async fn in_memory_store_evicts_least_recently_used() {
        let store = InMemorySnapshotStore::new(2);
        store.put(stream("a"), versioned(1)).await;
        store.put(stream("b"), versioned(2)).await;
        // Touch "a" so "b" is the eviction candidate.
        assert!(store.get(&stream("a")).await.is_some());
        store.put(stream("c"), versioned(3)).await;
        assert!(store.get(&stream("b")).await.is_none());
        assert!(store.get(&stream("a")).await.is_some());
        assert!(store.get(&stream("c")).await.is_some());
    }

    #[tokio::test]
    async fn persisted_store_reads_through_on_cold_miss() {
        let backing = Arc::new(RecordingPersistence::default());
        backing
            .saved
            .lock()
            .unwrap()
            .insert(stream("a"), versioned(9));
        let store = PersistedSnapshotStore::new(backing.clone(), SnapshotConfig::default());
        assert_eq!(store.get(&stream("a")).await, Some(versioned(9)));
        // Second read is served from memory; no extra backing traffic needed.
        assert_eq!(store.get(&stream("a")).await, Some(versioned(9)));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn persisted_store_flushes_when_buffer_fills() {
        let backing = Arc::new(RecordingPersistence::default());
        let config = SnapshotConfig {
            max_in_mem: 100,
            max_buffer: 3,
            max_wait: Duration::from_secs(3600),
        };
        let store = PersistedSnapshotStore::new(backing.clone(), config);
        store.put(stream("a"), versioned(1)).await;
        store.put(stream("b"), versioned(2)).await;
        assert_eq!(backing.saves.load(Ordering::SeqCst), 0);
        store.put(stream("c"), versioned(3)).await;
        assert_eq!(backing.saves.load(Ordering::SeqCst), 3);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn persisted_store_coalesces_writes_per_stream() {
        let backing = Arc::new(RecordingPersistence::default());
        let config = SnapshotConfig {
            max_in_mem: 100,
            max_buffer: 3,
            max_wait: Duration::from_secs(3600),
        };
        let store = PersistedSnapshotStore::new(backing.clone(), config);
        store.put(stream("a"), versioned(1)).await;
        store.put(stream("a"), versioned(2)).await;
        store.put(stream("a"), versioned(5)).await;
        // Three puts to the same stream count as one dirty entry.
        assert_eq!(backing.saves.load(Ordering::SeqCst), 0);
        store.flush().await;
        assert_eq!(backing.saves.load(Ordering::SeqCst), 1);
        assert_eq!(
            backing.saved.lock().unwrap().get(&stream("a")),
            Some(&versioned(5))
        );
        store.shutdown().await;
    }

    #[tokio::test]
    async fn persisted_store_flushes_dirty_entry_on_eviction() {
        let backing = Arc::new(RecordingPersistence::default());
        let config = SnapshotConfig {
            max_in_mem: 1,
            max_buffer: 100,
            max_wait: Duration::from_secs(3600),
        };
        let store = PersistedSnapshotStore::new(backing.clone(), config);
        store.put(stream("a"), versioned(1)).await;
        store.put(stream("b"), versioned(2)).await;
        // "a" was evicted dirty and must have been written out.
        assert_eq!(
            backing.saved.lock().unwrap().get(&stream("a")),
            Some(&versioned(1))
        );
        store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_store_flushes_after_max_wait() {
        let backing = Arc::new(RecordingPersistence::default());
        let config = SnapshotConfig {
            max_in_mem: 100,
            max_buffer: 100,
            max_wait: Duration::from_secs(2),
        };
        let store = PersistedSnapshotStore::new(backing.clone(), config);
        store.put(stream("a"), versioned(1)).await;
        assert_eq!(backing.saves.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backing.saves.load(Ordering::SeqCst), 1);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn persisted_store_keeps_entries_dirty_after_failed_flush() {
        let backing = Arc::new(RecordingPersistence::default());
        let config = SnapshotConfig {
            max_in_mem: 100,
            max_buffer: 100,
            max_wait: Duration::from_secs(3600),
        };
        let store = PersistedSnapshotStore::new(backing.clone(), config);
        store.put(stream("a"), versioned(1)).await;
        backing.fail_saves.store(true, Ordering::SeqCst);
        assert_eq!(store.flush().await, 0);
        backing.fail_saves.store(false, Ordering::SeqCst);
        assert_eq!(store.flush().await, 1);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_entries() {
        let backing = Arc::new(RecordingPersistence::default());
        let store = PersistedSnapshotStore::new(backing.clone(), SnapshotConfig::default());
        store.put(stream("a"), versioned(4)).await;
        store.shutdown().await;
        assert_eq!(
            backing.saved.lock().unwrap().get(&stream("a")),
            Some(&versioned(4))
        );
    }
}
