//! The command handler: load, decide, commit, retry.
//!
//! `process` is the write path of the whole runtime. It enforces idempotency
//! by command id, refuses commands against conflicted aggregates without
//! running user code, commits accepted decisions through the driver's single
//! atomic append, and retries version conflicts with exponential backoff.
//!
//! A command in flight moves through: loaded -> decided -> committed |
//! rejected | conflict-retry (back to loaded) | failed. Nothing is written
//! before the driver call, so cancelling a command mid-flight leaves no
//! trace; once the driver call returns, the commit is durable and cannot be
//! cancelled away.

use crate::command_store::CommandIdCache;
use crate::decision::Decision;
use crate::errors::{HandlerError, HandlerResult, JournalError};
use crate::journal::{AppendRequest, JournalReader, JournalWriter, NotifyRequest};
use crate::message::CommandMessage;
use crate::model::Model;
use crate::repository::{AggregateState, Repository};
use crate::response::Response;
use crate::snapshot::{SnapshotStore, VersionedState};
use crate::types::{NonEmptyVec, StreamId, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// The business outcome of a command: accepted (or ineffective), or
/// rejected with the model's reasons.
pub type CommandOutcome<R> = Result<(), NonEmptyVec<R>>;

/// Retry behaviour for version conflicts.
///
/// The delay before retry `i` (zero-based) is `initial_delay * 2^i`, capped
/// at `max_delay`. Only version conflicts are retried: rejections are
/// business outcomes and transport errors bubble up.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for the exponential backoff.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// The delay before the given zero-based retry.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Processes commands against a model over a storage driver.
///
/// Cheap to clone pieces are shared: the same handler value can be used from
/// any number of tasks concurrently. Per-stream write serialization comes
/// from the driver's expected-version check, not from locking here.
pub struct CommandHandler<M: Model, D> {
    model: Arc<M>,
    driver: D,
    repository: Repository<M, D>,
    snapshots: Arc<dyn SnapshotStore<State = M::State>>,
    commands: Option<Arc<CommandIdCache>>,
    retry: RetryConfig,
    record_rejections: bool,
}

enum Attempt<R> {
    Done(CommandOutcome<R>),
    Conflict(StreamId),
}

impl<M, D> CommandHandler<M, D>
where
    M: Model,
    D: JournalReader<Event = M::Event>
        + JournalWriter<Event = M::Event, Notification = M::Notification>
        + Clone
        + Send
        + Sync
        + 'static,
{
    /// Wires a handler from its collaborators.
    ///
    /// `commands` is the optional idempotency cache; `record_rejections`
    /// controls whether rejected command ids are remembered so client
    /// retries of a rejected command skip re-deciding.
    pub fn new(
        model: Arc<M>,
        driver: D,
        repository: Repository<M, D>,
        snapshots: Arc<dyn SnapshotStore<State = M::State>>,
        commands: Option<Arc<CommandIdCache>>,
        retry: RetryConfig,
        record_rejections: bool,
    ) -> Self {
        Self {
            model,
            driver,
            repository,
            snapshots,
            commands,
            retry,
            record_rejections,
        }
    }

    /// Applies a command: fold, decide, commit.
    ///
    /// The outer `Result` is infrastructure: storage failures and exhausted
    /// conflict retries. The inner [`CommandOutcome`] is the business
    /// answer: `Ok(())` for accepted, ineffective, and already-processed
    /// commands; `Err(reasons)` when the model (or a conflicted aggregate)
    /// refuses the command.
    #[instrument(skip(self, command), fields(command_id = %command.id, stream_id = %command.address))]
    pub async fn process(
        &self,
        command: &CommandMessage<M::Command>,
    ) -> HandlerResult<CommandOutcome<M::Rejection>> {
        if let Some(cache) = &self.commands {
            if cache.contains(&command.id) {
                debug!("command already processed, skipping");
                return Ok(Ok(()));
            }
        }

        let mut retry = 0u32;
        loop {
            match self.attempt(command).await? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Conflict(stream) => {
                    if retry >= self.retry.max_retries {
                        warn!(attempts = retry + 1, "version conflict retries exhausted");
                        return Err(HandlerError::RetriesExhausted {
                            stream,
                            attempts: retry + 1,
                        });
                    }
                    let delay = self.retry.delay_for(retry);
                    info!(
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "version conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    /// One load-decide-commit pass.
    async fn attempt(
        &self,
        command: &CommandMessage<M::Command>,
    ) -> HandlerResult<Attempt<M::Rejection>> {
        let state = match self.repository.get(&command.address).await {
            Ok(state) => state,
            Err(error) => return Err(HandlerError::Journal(error)),
        };

        let loaded = match state {
            AggregateState::Conflicted { errors, .. } => {
                // The stream itself is broken; the decider never runs.
                debug!("aggregate is conflicted, rejecting without deciding");
                return Ok(Attempt::Done(Err(errors)));
            }
            AggregateState::Valid(loaded) => loaded,
        };

        let Response {
            decision,
            notifications,
        } = self.model.decide(&loaded.state, command);

        match decision {
            Decision::Rejected(reasons) => {
                if self.record_rejections {
                    self.record(command);
                }
                Ok(Attempt::Done(Err(reasons)))
            }
            Decision::Indecisive(()) => match NonEmptyVec::try_from_vec(notifications) {
                None => {
                    self.record(command);
                    Ok(Attempt::Done(Ok(())))
                }
                Some(batch) => {
                    let request = NotifyRequest {
                        stream_id: command.address.clone(),
                        command_id: command.id,
                        notifications: batch,
                    };
                    match self.driver.notify(request).await {
                        Ok(()) | Err(JournalError::DuplicateCommand(_)) => {
                            self.record(command);
                            Ok(Attempt::Done(Ok(())))
                        }
                        Err(error) => Err(HandlerError::Journal(error)),
                    }
                }
            },
            Decision::Accepted(events, ()) => {
                let folded = self.fold_for_snapshot(&loaded, &events);
                let count = events.len();
                let request = AppendRequest {
                    stream_id: command.address.clone(),
                    time: Timestamp::now(),
                    expected_version: loaded.version,
                    events,
                    notifications,
                    command_id: command.id,
                };
                match self.driver.append(request).await {
                    Ok(()) => {
                        info!(events = count, "command committed");
                        if let Some(next) = folded {
                            self.snapshots.put(command.address.clone(), next).await;
                        }
                        self.record(command);
                        Ok(Attempt::Done(Ok(())))
                    }
                    Err(JournalError::VersionConflict { stream, .. }) => {
                        Ok(Attempt::Conflict(stream))
                    }
                    Err(JournalError::DuplicateCommand(_)) => {
                        // Another delivery of this command won the race; the
                        // effects are already durable.
                        self.record(command);
                        Ok(Attempt::Done(Ok(())))
                    }
                    Err(error) => Err(HandlerError::Journal(error)),
                }
            }
        }
    }

    fn record(&self, command: &CommandMessage<M::Command>) {
        if let Some(cache) = &self.commands {
            cache.add(command.id);
        }
    }

    /// Folds freshly accepted events over the loaded state so the snapshot
    /// store can be updated without re-reading the journal.
    fn fold_for_snapshot(
        &self,
        loaded: &VersionedState<M::State>,
        events: &NonEmptyVec<M::Event>,
    ) -> Option<VersionedState<M::State>> {
        let mut state = loaded.state.clone();
        for event in events {
            match self.model.transition(&state, event) {
                Ok(next) => state = next,
                Err(_) => {
                    // The decider produced events its own fold refuses. The
                    // journal write still stands; the snapshot is skipped and
                    // the next load will surface the conflict.
                    warn!("accepted events do not fold cleanly, skipping snapshot update");
                    return None;
                }
            }
        }
        Some(VersionedState::new(
            state,
            loaded.version.advanced_by(events.len() as u64),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::EventStream;
    use crate::message::{EventMessage, EventMetadata};
    use crate::model::ModelResponse;
    use crate::types::{CommandId, EventId, EventVersion, SeqNr};
    use futures::stream::{self, BoxStream, StreamExt};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Cmd {
        Deposit(u64),
        Withdraw(u64),
        Validate,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Evt {
        Deposited(u64),
        Withdrawn(u64),
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct Account {
        balance: u64,
    }

    struct AccountModel {
        decides: AtomicUsize,
    }

    impl AccountModel {
        fn new() -> Self {
            Self {
                decides: AtomicUsize::new(0),
            }
        }
    }

    impl Model for AccountModel {
        type State = Account;
        type Command = Cmd;
        type Event = Evt;
        type Rejection = String;
        type Notification = String;

        fn initial(&self) -> Account {
            Account::default()
        }

        fn transition(
            &self,
            state: &Account,
            event: &Evt,
        ) -> Result<Account, NonEmptyVec<String>> {
            match event {
                Evt::Deposited(amount) => Ok(Account {
                    balance: state.balance + amount,
                }),
                Evt::Withdrawn(amount) if *amount <= state.balance => Ok(Account {
                    balance: state.balance - amount,
                }),
                Evt::Withdrawn(_) => Err(NonEmptyVec::new("overdraft".to_string())),
            }
        }

        fn decide(
            &self,
            state: &Account,
            command: &CommandMessage<Cmd>,
        ) -> ModelResponse<Self> {
            self.decides.fetch_add(1, Ordering::SeqCst);
            match &command.payload {
                Cmd::Deposit(amount) => {
                    Response::accept(Evt::Deposited(*amount)).publish([format!("+{amount}")])
                }
                Cmd::Withdraw(amount) if *amount <= state.balance => {
                    Response::accept(Evt::Withdrawn(*amount)).publish([format!("-{amount}")])
                }
                Cmd::Withdraw(_) => Response::reject("insufficient funds".to_string()),
                Cmd::Validate => Response::pure(()),
            }
        }
    }

    /// Scriptable driver: holds a journal in memory and can be told to fail
    /// the next appends with a version conflict.
    #[derive(Clone)]
    struct ScriptedDriver {
        events: Arc<Mutex<Vec<EventMessage<Evt>>>>,
        notified: Arc<Mutex<Vec<String>>>,
        appends: Arc<AtomicUsize>,
        conflicts_left: Arc<AtomicU32>,
    }

    impl ScriptedDriver {
        fn new() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
                notified: Arc::new(Mutex::new(Vec::new())),
                appends: Arc::new(AtomicUsize::new(0)),
                conflicts_left: Arc::new(AtomicU32::new(0)),
            }
        }

        fn fail_next_appends(&self, count: u32) {
            self.conflicts_left.store(count, Ordering::SeqCst);
        }

        fn seed_event(&self, stream: &StreamId, version: u64, payload: Evt) {
            let mut events = self.events.lock().unwrap();
            let seq = events.len() as u64 + 1;
            events.push(EventMessage::new(
                EventMetadata::new(
                    EventId::new(),
                    Timestamp::now(),
                    SeqNr::try_new(seq).unwrap(),
                    EventVersion::try_new(version).unwrap(),
                    stream.clone(),
                ),
                payload,
            ));
        }
    }

    #[async_trait::async_trait]
    impl JournalWriter for ScriptedDriver {
        type Event = Evt;
        type Notification = String;

        async fn append(&self, request: AppendRequest<Evt, String>) -> crate::errors::JournalResult<()> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            if self.conflicts_left.load(Ordering::SeqCst) > 0 {
                self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
                return Err(JournalError::VersionConflict {
                    stream: request.stream_id,
                    expected: request.expected_version,
                    current: request.expected_version.next(),
                });
            }
            let mut version = request.expected_version;
            for payload in request.events {
                version = version.next();
                self.seed_event(&request.stream_id, version.into(), payload);
            }
            self.notified.lock().unwrap().extend(request.notifications);
            Ok(())
        }

        async fn notify(&self, request: NotifyRequest<String>) -> crate::errors::JournalResult<()> {
            self.notified
                .lock()
                .unwrap()
                .extend(request.notifications.into_vec());
            Ok(())
        }
    }

    impl JournalReader for ScriptedDriver {
        type Event = Evt;

        fn read_stream(&self, stream_id: &StreamId) -> EventStream<Evt> {
            self.read_stream_after(stream_id, EventVersion::initial())
        }

        fn read_stream_after(&self, stream_id: &StreamId, after: EventVersion) -> EventStream<Evt> {
            let stream_id = stream_id.clone();
            let matching: Vec<_> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.metadata.stream_id == stream_id && e.metadata.version > after)
                .cloned()
                .map(Ok)
                .collect();
            stream::iter(matching).boxed()
        }

        fn read_stream_before(&self, stream_id: &StreamId, before: EventVersion) -> EventStream<Evt> {
            let stream_id = stream_id.clone();
            let matching: Vec<_> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.metadata.stream_id == stream_id && e.metadata.version < before)
                .cloned()
                .map(Ok)
                .collect();
            stream::iter(matching).boxed()
        }

        fn read_all(&self) -> EventStream<Evt> {
            let all: Vec<_> = self.events.lock().unwrap().iter().cloned().map(Ok).collect();
            stream::iter(all).boxed()
        }

        fn read_all_after(&self, after: SeqNr) -> EventStream<Evt> {
            let matching: Vec<_> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.metadata.seq_nr > after)
                .cloned()
                .map(Ok)
                .collect();
            stream::iter(matching).boxed()
        }

        fn notifications(&self) -> BoxStream<'static, StreamId> {
            stream::empty().boxed()
        }
    }

    fn handler(
        model: Arc<AccountModel>,
        driver: ScriptedDriver,
        retry: RetryConfig,
    ) -> CommandHandler<AccountModel, ScriptedDriver> {
        let snapshots: Arc<dyn SnapshotStore<State = Account>> =
            Arc::new(crate::snapshot::InMemorySnapshotStore::new(16));
        let repository = Repository::new(Arc::clone(&model), driver.clone(), Arc::clone(&snapshots));
        CommandHandler::new(
            model,
            driver,
            repository,
            snapshots,
            Some(Arc::new(CommandIdCache::new(16))),
            retry,
            true,
        )
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
        }
    }

    fn stream() -> StreamId {
        StreamId::try_new("account-1").unwrap()
    }

    #[tokio::test]
    async fn accepted_command_appends_and_notifies() {
        let model = Arc::new(AccountModel::new());
        let driver = ScriptedDriver::new();
        let handler = handler(Arc::clone(&model), driver.clone(), fast_retry());

        let cmd = CommandMessage::new(CommandId::random(), stream(), Cmd::Deposit(100));
        let outcome = handler.process(&cmd).await.unwrap();
        assert_eq!(outcome, Ok(()));

        let events = driver.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, Evt::Deposited(100));
        assert_eq!(u64::from(events[0].metadata.version), 1);
        drop(events);
        assert_eq!(*driver.notified.lock().unwrap(), vec!["+100".to_string()]);
    }

    #[tokio::test]
    async fn rejected_command_writes_nothing() {
        let model = Arc::new(AccountModel::new());
        let driver = ScriptedDriver::new();
        let handler = handler(Arc::clone(&model), driver.clone(), fast_retry());

        let cmd = CommandMessage::new(CommandId::random(), stream(), Cmd::Withdraw(10));
        let outcome = handler.process(&cmd).await.unwrap();
        assert_eq!(
            outcome,
            Err(NonEmptyVec::new("insufficient funds".to_string()))
        );
        assert!(driver.events.lock().unwrap().is_empty());
        assert!(driver.notified.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recorded_rejection_is_not_re_decided() {
        let model = Arc::new(AccountModel::new());
        let driver = ScriptedDriver::new();
        let handler = handler(Arc::clone(&model), driver.clone(), fast_retry());

        let cmd = CommandMessage::new(CommandId::random(), stream(), Cmd::Withdraw(10));
        let first = handler.process(&cmd).await.unwrap();
        assert!(first.is_err());
        let second = handler.process(&cmd).await.unwrap();
        // The replay is answered from the command cache without deciding
        // again; by contract it reports success-with-no-effects.
        assert_eq!(second, Ok(()));
        assert_eq!(model.decides.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_command_id_is_skipped() {
        let model = Arc::new(AccountModel::new());
        let driver = ScriptedDriver::new();
        let handler = handler(Arc::clone(&model), driver.clone(), fast_retry());

        let cmd = CommandMessage::new(CommandId::random(), stream(), Cmd::Deposit(100));
        handler.process(&cmd).await.unwrap();
        handler.process(&cmd).await.unwrap();

        assert_eq!(driver.events.lock().unwrap().len(), 1);
        assert_eq!(model.decides.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn indecisive_command_records_without_writing() {
        let model = Arc::new(AccountModel::new());
        let driver = ScriptedDriver::new();
        let handler = handler(Arc::clone(&model), driver.clone(), fast_retry());

        let cmd = CommandMessage::new(CommandId::random(), stream(), Cmd::Validate);
        assert_eq!(handler.process(&cmd).await.unwrap(), Ok(()));
        assert!(driver.events.lock().unwrap().is_empty());
        // Replay short-circuits on the cache.
        assert_eq!(handler.process(&cmd).await.unwrap(), Ok(()));
        assert_eq!(model.decides.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn version_conflict_is_retried_until_it_clears() {
        let model = Arc::new(AccountModel::new());
        let driver = ScriptedDriver::new();
        let handler = handler(Arc::clone(&model), driver.clone(), fast_retry());
        driver.fail_next_appends(2);

        let cmd = CommandMessage::new(CommandId::random(), stream(), Cmd::Deposit(50));
        assert_eq!(handler.process(&cmd).await.unwrap(), Ok(()));
        assert_eq!(driver.appends.load(Ordering::SeqCst), 3);
        assert_eq!(driver.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_terminal_error() {
        let model = Arc::new(AccountModel::new());
        let driver = ScriptedDriver::new();
        let handler = handler(Arc::clone(&model), driver.clone(), fast_retry());
        driver.fail_next_appends(10);

        let cmd = CommandMessage::new(CommandId::random(), stream(), Cmd::Deposit(50));
        let error = handler.process(&cmd).await.unwrap_err();
        assert!(matches!(
            error,
            HandlerError::RetriesExhausted { attempts: 4, .. }
        ));
        assert!(driver.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicted_aggregate_rejects_without_deciding() {
        let model = Arc::new(AccountModel::new());
        let driver = ScriptedDriver::new();
        // Withdrawal exceeding the balance cannot fold: poison event.
        driver.seed_event(&stream(), 1, Evt::Withdrawn(1_000));
        let handler = handler(Arc::clone(&model), driver.clone(), fast_retry());

        let cmd = CommandMessage::new(CommandId::random(), stream(), Cmd::Deposit(10));
        let outcome = handler.process(&cmd).await.unwrap();
        assert_eq!(outcome, Err(NonEmptyVec::new("overdraft".to_string())));
        assert_eq!(model.decides.load(Ordering::SeqCst), 0);
        assert_eq!(driver.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn retry_delays_double_and_cap() {
        let retry = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(3), Duration::from_millis(500));
        assert_eq!(retry.delay_for(31), Duration::from_millis(500));
        assert_eq!(retry.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn default_retry_config_matches_documented_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_delay, Duration::from_secs(2));
    }
}
