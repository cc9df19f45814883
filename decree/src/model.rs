//! The domain capability: a fold over events and a decider over commands.

use crate::message::CommandMessage;
use crate::response::Response;
use crate::types::NonEmptyVec;

/// Shorthand for the response type a model's decider returns.
pub type ModelResponse<M> = Response<
    <M as Model>::Rejection,
    <M as Model>::Event,
    <M as Model>::Notification,
    (),
>;

/// A user-supplied domain model.
///
/// Everything the runtime knows about a domain comes through this trait: the
/// blank state of a fresh aggregate, how a single event advances state, and
/// how a command is decided against the current state. Both functions are
/// pure; all effects live in the runtime around them.
///
/// `transition` may fail. A failing transition during replay marks the
/// aggregate *conflicted*: the fold stops advancing and subsequent commands
/// on that stream are refused with the fold errors, without the decider ever
/// running.
pub trait Model: Send + Sync + 'static {
    /// Aggregate state, materialised by folding events.
    type State: Clone + Send + Sync + 'static;
    /// Command payloads this model decides.
    type Command: Send + Sync + 'static;
    /// Domain events, the durable source of truth.
    type Event: Clone + Send + Sync + 'static;
    /// Why a command or a fold step was refused.
    type Rejection: Clone + Send + Sync + 'static;
    /// Outbound messages published through the outbox.
    type Notification: Clone + Send + Sync + 'static;

    /// The state of a stream before its first event.
    fn initial(&self) -> Self::State;

    /// Advances state by one event, or reports why the event does not apply.
    fn transition(
        &self,
        state: &Self::State,
        event: &Self::Event,
    ) -> Result<Self::State, NonEmptyVec<Self::Rejection>>;

    /// Decides a command against the current state.
    fn decide(
        &self,
        state: &Self::State,
        command: &CommandMessage<Self::Command>,
    ) -> ModelResponse<Self>;
}
