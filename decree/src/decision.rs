//! The three-valued result of running a command against aggregate state.
//!
//! A [`Decision`] is either *indecisive* (no events, carries a result),
//! *accepted* (at least one event plus a result), or *rejected* (at least one
//! reason). The three cases compose monadically with two asymmetries worth
//! internalising:
//!
//! - rejection is sticky on the left: once rejected, later steps never run;
//! - rejection wins on the right: a later rejection discards events an
//!   earlier step had accepted, because nothing gets committed.
//!
//! Indecisive is deliberately not "accepted with zero events". A
//! validate-only command stays indecisive and composes with event-emitting
//! commands without pretending to produce events, which is what keeps the
//! accumulation laws honest.

use crate::types::NonEmptyVec;
use std::ops::ControlFlow;

/// Outcome of deciding a command over state: no change, change, or refusal.
///
/// Type parameters: `R` rejection reason, `E` domain event, `T` carried
/// result value.
///
/// # Examples
///
/// ```
/// use decree::decision::Decision;
///
/// let d: Decision<&str, u32, ()> = Decision::accept(7).and_then(|()| Decision::accept(8));
/// assert_eq!(d.events(), &[7, 8]);
///
/// let r: Decision<&str, u32, ()> = Decision::accept(7).and_then(|()| Decision::reject("no"));
/// assert!(r.is_rejected());
/// assert!(r.events().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<R, E, T> {
    /// The command changes nothing; `T` is the carried result.
    Indecisive(T),
    /// The command produced events, to be applied in order.
    Accepted(NonEmptyVec<E>, T),
    /// The command was refused for the given reasons.
    Rejected(NonEmptyVec<R>),
}

impl<R, E, T> Decision<R, E, T> {
    /// Lifts a plain value into an indecisive decision.
    pub fn pure(value: T) -> Self {
        Self::Indecisive(value)
    }

    /// Rejects with a single reason.
    pub fn reject(reason: R) -> Self {
        Self::Rejected(NonEmptyVec::new(reason))
    }

    /// Rejects with one or more reasons.
    pub fn reject_all(reasons: NonEmptyVec<R>) -> Self {
        Self::Rejected(reasons)
    }

    /// Accepts one or more events, carrying `value` as the result.
    pub fn accept_returning(value: T, events: NonEmptyVec<E>) -> Self {
        Self::Accepted(events, value)
    }

    /// True when this decision carries events.
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_, _))
    }

    /// True when this decision is a rejection.
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// True when this decision changes nothing.
    pub const fn is_indecisive(&self) -> bool {
        matches!(self, Self::Indecisive(_))
    }

    /// The accepted events, empty unless accepted.
    pub fn events(&self) -> &[E] {
        match self {
            Self::Accepted(events, _) => events.as_slice(),
            Self::Indecisive(_) | Self::Rejected(_) => &[],
        }
    }

    /// Applies `f` to the carried result, preserving events and rejection.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decision<R, E, U> {
        match self {
            Self::Indecisive(value) => Decision::Indecisive(f(value)),
            Self::Accepted(events, value) => Decision::Accepted(events, f(value)),
            Self::Rejected(reasons) => Decision::Rejected(reasons),
        }
    }

    /// Sequences a dependent decision.
    ///
    /// Events accumulate left-to-right while both sides are non-rejected. A
    /// left rejection short-circuits without running `f`. A right rejection
    /// wins outright: the left side's events are discarded, because a
    /// rejected transaction commits nothing.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Decision<R, E, U>) -> Decision<R, E, U> {
        match self {
            Self::Rejected(reasons) => Decision::Rejected(reasons),
            Self::Indecisive(value) => f(value),
            Self::Accepted(mut events, value) => match f(value) {
                Decision::Indecisive(next) => Decision::Accepted(events, next),
                Decision::Accepted(more, next) => {
                    events.append(more);
                    Decision::Accepted(events, next)
                }
                Decision::Rejected(reasons) => Decision::Rejected(reasons),
            },
        }
    }

    /// Converts to a result, folding indecisive and accepted into `Ok`.
    pub fn into_result(self) -> Result<T, NonEmptyVec<R>> {
        match self {
            Self::Indecisive(value) | Self::Accepted(_, value) => Ok(value),
            Self::Rejected(reasons) => Err(reasons),
        }
    }

    /// Splits into events and result, or rejection reasons.
    pub fn into_parts(self) -> Result<(Vec<E>, T), NonEmptyVec<R>> {
        match self {
            Self::Indecisive(value) => Ok((Vec::new(), value)),
            Self::Accepted(events, value) => Ok((events.into_vec(), value)),
            Self::Rejected(reasons) => Err(reasons),
        }
    }
}

impl<R, E> Decision<R, E, ()> {
    /// Accepts a single event.
    pub fn accept(event: E) -> Self {
        Self::Accepted(NonEmptyVec::new(event), ())
    }

    /// Accepts one or more events.
    pub fn accept_all(events: NonEmptyVec<E>) -> Self {
        Self::Accepted(events, ())
    }
}

impl<R, E, T> Decision<R, E, T> {
    /// Iterates `step` from `init` until it breaks, in constant stack space.
    ///
    /// This is the loop form of repeated [`and_then`](Self::and_then): events
    /// accumulate across continuing steps, any rejection ends the loop and
    /// discards accumulated events, and `ControlFlow::Break` yields the final
    /// decision. Long accept chains run in a plain loop rather than through
    /// nested closures, so iteration depth is bounded only by patience.
    pub fn iterate<A>(
        init: A,
        mut step: impl FnMut(A) -> Decision<R, E, ControlFlow<T, A>>,
    ) -> Self {
        let mut accumulated: Option<NonEmptyVec<E>> = None;
        let mut current = init;
        loop {
            let (events, flow) = match step(current) {
                Decision::Rejected(reasons) => return Self::Rejected(reasons),
                Decision::Indecisive(flow) => (None, flow),
                Decision::Accepted(events, flow) => (Some(events), flow),
            };
            if let Some(events) = events {
                match accumulated.as_mut() {
                    Some(acc) => acc.append(events),
                    None => accumulated = Some(events),
                }
            }
            match flow {
                ControlFlow::Continue(next) => current = next,
                ControlFlow::Break(value) => {
                    return match accumulated {
                        Some(events) => Self::Accepted(events, value),
                        None => Self::Indecisive(value),
                    };
                }
            }
        }
    }
}
