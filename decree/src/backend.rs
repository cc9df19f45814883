//! Wiring a model and a storage driver into a running backend.
//!
//! The builder resolves the construction cycle explicitly: the snapshot
//! store is built first, the repository over it, the handler over both.
//! Nothing holds a back-reference.

use crate::command_store::CommandIdCache;
use crate::handler::{CommandHandler, CommandOutcome, RetryConfig};
use crate::journal::{JournalReader, JournalWriter};
use crate::message::CommandMessage;
use crate::model::Model;
use crate::notifications::NotificationsConsumer;
use crate::outbox::OutboxReader;
use crate::repository::Repository;
use crate::snapshot::{
    InMemorySnapshotStore, PersistedSnapshotStore, SnapshotConfig, SnapshotPersistence,
    SnapshotStore,
};
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::info;

/// Everything the backend requires of a storage driver.
///
/// Drivers implement the individual ports; this alias exists so signatures
/// stay readable. Blanket-implemented for any type satisfying the bounds.
pub trait StorageDriver<M: Model>:
    JournalReader<Event = M::Event>
    + JournalWriter<Event = M::Event, Notification = M::Notification>
    + OutboxReader<Notification = M::Notification>
    + SnapshotPersistence<State = M::State>
    + NotificationsConsumer
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<M: Model, D> StorageDriver<M> for D where
    D: JournalReader<Event = M::Event>
        + JournalWriter<Event = M::Event, Notification = M::Notification>
        + OutboxReader<Notification = M::Notification>
        + SnapshotPersistence<State = M::State>
        + NotificationsConsumer
        + Clone
        + Send
        + Sync
        + 'static
{
}

/// Backend-wide configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Version-conflict retry behaviour.
    pub retry: RetryConfig,
    /// Whether to keep the command-id idempotency cache.
    pub cached: bool,
    /// Capacity of the command-id cache.
    pub command_cache_size: usize,
    /// Whether rejected command ids are remembered so client retries skip
    /// re-deciding.
    pub record_rejections: bool,
    /// Snapshot cache and flush tuning.
    pub snapshots: SnapshotConfig,
    /// Whether snapshots are written through to the driver's persistence.
    /// When `false` the cache is purely in-memory.
    pub persist_snapshots: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            cached: true,
            command_cache_size: 100,
            record_rejections: true,
            snapshots: SnapshotConfig::default(),
            persist_snapshots: true,
        }
    }
}

/// Builder for [`Backend`].
pub struct BackendBuilder<M: Model, D> {
    model: M,
    driver: D,
    config: BackendConfig,
}

impl<M, D> BackendBuilder<M, D>
where
    M: Model,
    D: StorageDriver<M>,
{
    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Sets the snapshot configuration.
    #[must_use]
    pub fn snapshots(mut self, snapshots: SnapshotConfig) -> Self {
        self.config.snapshots = snapshots;
        self
    }

    /// Disables the command-id cache; the driver's unique index remains the
    /// idempotency guard.
    #[must_use]
    pub fn without_command_cache(mut self) -> Self {
        self.config.cached = false;
        self
    }

    /// Keeps snapshots purely in memory.
    #[must_use]
    pub fn in_memory_snapshots(mut self) -> Self {
        self.config.persist_snapshots = false;
        self
    }

    /// Composes the backend: snapshot store, then repository, then handler.
    pub fn build(self) -> Backend<M, D> {
        let Self {
            model,
            driver,
            config,
        } = self;
        let model = Arc::new(model);

        let mut persisted = None;
        let snapshots: Arc<dyn SnapshotStore<State = M::State>> = if config.persist_snapshots {
            let store = PersistedSnapshotStore::new(driver.clone(), config.snapshots.clone());
            persisted = Some(Arc::clone(&store));
            store
        } else {
            Arc::new(InMemorySnapshotStore::new(config.snapshots.max_in_mem))
        };

        let repository = Repository::new(Arc::clone(&model), driver.clone(), Arc::clone(&snapshots));

        let commands = config
            .cached
            .then(|| Arc::new(CommandIdCache::new(config.command_cache_size)));
        let handler = CommandHandler::new(
            Arc::clone(&model),
            driver.clone(),
            repository.clone(),
            Arc::clone(&snapshots),
            commands,
            config.retry.clone(),
            config.record_rejections,
        );

        info!("backend assembled");
        Backend {
            handler,
            repository,
            driver,
            persisted,
        }
    }
}

/// A composed command-handling backend over one model and one driver.
///
/// Acquired as a scoped resource: build it, use it from any number of
/// tasks, and call [`shutdown`](Self::shutdown) on the way out to flush
/// buffered snapshots and stop background work. Journal data is durable the
/// moment a command commits; shutdown only affects caches.
pub struct Backend<M: Model, D: StorageDriver<M>> {
    handler: CommandHandler<M, D>,
    repository: Repository<M, D>,
    driver: D,
    persisted: Option<Arc<PersistedSnapshotStore<D>>>,
}

impl<M, D> Backend<M, D>
where
    M: Model,
    D: StorageDriver<M>,
{
    /// Starts building a backend from a model and a storage driver.
    pub fn builder(model: M, driver: D) -> BackendBuilder<M, D> {
        BackendBuilder {
            model,
            driver,
            config: BackendConfig::default(),
        }
    }

    /// Applies a command. See [`CommandHandler::process`].
    pub async fn process(
        &self,
        command: &CommandMessage<M::Command>,
    ) -> crate::errors::HandlerResult<CommandOutcome<M::Rejection>> {
        self.handler.process(command).await
    }

    /// The command handler.
    pub const fn handler(&self) -> &CommandHandler<M, D> {
        &self.handler
    }

    /// The repository for reads and history.
    pub const fn repository(&self) -> &Repository<M, D> {
        &self.repository
    }

    /// The driver, for journal, outbox, and update-feed access.
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// A fresh commit wake-up stream. See
    /// [`NotificationsConsumer::listen`].
    pub fn updates(&self) -> BoxStream<'static, ()> {
        self.driver.listen()
    }

    /// Flushes buffered snapshots and stops background tasks.
    pub async fn shutdown(self) {
        if let Some(persisted) = &self.persisted {
            persisted.shutdown().await;
        }
        info!("backend shut down");
    }
}
