//! A decision paired with its outbound notification log.
//!
//! [`Response`] is what a domain decider returns: the [`Decision`] itself
//! plus the notifications to publish if the surrounding transaction commits.
//! Composition follows the decision, with one extra rule for the log:
//!
//! - both sides non-rejected: notifications concatenate, left then right;
//! - right side rejected: only the right side's notifications survive; a
//!   rejection erases the side-effect intent accumulated earlier in the same
//!   transaction;
//! - left side rejected: the right side never runs, the left response stands.
//!
//! [`publish_on_rejection`](Response::publish_on_rejection) exists for flows
//! that want to signal refusals; whether such notifications reach a durable
//! outbox is the command handler's policy, not the algebra's.

use crate::decision::Decision;
use crate::types::NonEmptyVec;

/// A [`Decision`] carrying a sequence of outbound notifications.
///
/// Type parameters: `R` rejection reason, `E` domain event, `N` notification,
/// `T` carried result value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<R, E, N, T> {
    /// The underlying decision.
    pub decision: Decision<R, E, T>,
    /// Notifications to publish when the transaction commits.
    pub notifications: Vec<N>,
}

impl<R, E, N, T> Response<R, E, N, T> {
    /// Wraps a decision with an empty notification log.
    pub fn new(decision: Decision<R, E, T>) -> Self {
        Self {
            decision,
            notifications: Vec::new(),
        }
    }

    /// Lifts a plain value: indecisive, nothing to publish.
    pub fn pure(value: T) -> Self {
        Self::new(Decision::pure(value))
    }

    /// Rejects with a single reason.
    pub fn reject(reason: R) -> Self {
        Self::new(Decision::reject(reason))
    }

    /// Rejects with one or more reasons.
    pub fn reject_all(reasons: NonEmptyVec<R>) -> Self {
        Self::new(Decision::reject_all(reasons))
    }

    /// Appends notifications unconditionally.
    #[must_use]
    pub fn publish(mut self, notifications: impl IntoIterator<Item = N>) -> Self {
        self.notifications.extend(notifications);
        self
    }

    /// Appends notifications only when the current decision is rejected.
    #[must_use]
    pub fn publish_on_rejection(mut self, notifications: impl IntoIterator<Item = N>) -> Self {
        if self.decision.is_rejected() {
            self.notifications.extend(notifications);
        }
        self
    }

    /// Clears the notification log, keeping the decision.
    #[must_use]
    pub fn reset(mut self) -> Self {
        self.notifications.clear();
        self
    }

    /// Applies `f` to the carried result, preserving everything else.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<R, E, N, U> {
        Response {
            decision: self.decision.map(f),
            notifications: self.notifications,
        }
    }

    /// Sequences a dependent response.
    ///
    /// The decisions compose per [`Decision::and_then`]. The notification
    /// logs concatenate unless the right side rejects, in which case only the
    /// right side's log survives. A rejected left side absorbs: `f` is not
    /// run and `self` is returned unchanged.
    pub fn and_then<U>(
        self,
        f: impl FnOnce(T) -> Response<R, E, N, U>,
    ) -> Response<R, E, N, U> {
        let Self {
            decision,
            mut notifications,
        } = self;
        let (events, value) = match decision {
            Decision::Rejected(reasons) => {
                return Response {
                    decision: Decision::Rejected(reasons),
                    notifications,
                };
            }
            Decision::Indecisive(value) => (None, value),
            Decision::Accepted(events, value) => (Some(events), value),
        };
        let Response {
            decision: right,
            notifications: right_notifications,
        } = f(value);
        match right {
            Decision::Rejected(reasons) => Response {
                decision: Decision::Rejected(reasons),
                notifications: right_notifications,
            },
            Decision::Indecisive(next) => {
                notifications.extend(right_notifications);
                Response {
                    decision: match events {
                        None => Decision::Indecisive(next),
                        Some(events) => Decision::Accepted(events, next),
                    },
                    notifications,
                }
            }
            Decision::Accepted(more, next) => {
                notifications.extend(right_notifications);
                Response {
                    decision: match events {
                        None => Decision::Accepted(more, next),
                        Some(mut events) => {
                            events.append(more);
                            Decision::Accepted(events, next)
                        }
                    },
                    notifications,
                }
            }
        }
    }
}

impl<R, E, N> Response<R, E, N, ()> {
    /// Accepts a single event.
    pub fn accept(event: E) -> Self {
        Self::new(Decision::accept(event))
    }

    /// Accepts one or more events.
    pub fn accept_all(events: NonEmptyVec<E>) -> Self {
        Self::new(Decision::accept_all(events))
    }
}

impl<R, E, N, T> From<Decision<R, E, T>> for Response<R, E, N, T> {
    fn from(decision: Decision<R, E, T>) -> Self {
        Self::new(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type Resp = Response<String, u32, char, u32>;

    fn arb_response() -> impl Strategy<Value = Resp> {
        let decision = prop_oneof![
            any::<u32>().prop_map(Decision::Indecisive),
            (proptest::collection::vec(any::<u32>(), 1..4), any::<u32>()).prop_map(
                |(events, value)| {
                    Decision::Accepted(NonEmptyVec::try_from_vec(events).unwrap(), value)
                }
            ),
            proptest::collection::vec("[a-z]{1,6}", 1..3).prop_map(|reasons| {
                Decision::Rejected(NonEmptyVec::try_from_vec(reasons).unwrap())
            }),
        ];
        (decision, proptest::collection::vec(any::<char>(), 0..4)).prop_map(
            |(decision, notifications)| Response {
                decision,
                notifications,
            },
        )
    }

    proptest! {
        #[test]
        fn notifications_accumulate_when_both_sides_pass(a in arb_response(), b in arb_response()) {
            prop_assume!(!a.decision.is_rejected() && !b.decision.is_rejected());
            let combined = a.clone().and_then(|_| b.clone());
            let mut expected = a.notifications.clone();
            expected.extend(b.notifications.clone());
            prop_assert_eq!(combined.notifications, expected);
        }

        #[test]
        fn right_rejection_resets_to_right_notifications(a in arb_response(), b in arb_response()) {
            prop_assume!(!a.decision.is_rejected() && b.decision.is_rejected());
            let combined = a.and_then(|_| b.clone());
            prop_assert_eq!(combined.notifications.clone(), b.notifications.clone());
            prop_assert_eq!(combined.decision, b.decision);
        }

        #[test]
        fn left_rejection_absorbs_unchanged(a in arb_response(), b in arb_response()) {
            prop_assume!(a.decision.is_rejected());
            let combined = a.clone().and_then(|_| b.clone());
            prop_assert_eq!(combined.notifications.clone(), a.notifications.clone());
            prop_assert_eq!(combined.decision, a.decision.map(|_| 0u32));
        }

        #[test]
        fn decisions_compose_like_plain_decisions(a in arb_response(), b in arb_response()) {
            let combined = a.clone().and_then(|_| b.clone()).decision;
            let expected = a.decision.and_then(|_| b.decision);
            prop_assert_eq!(combined, expected);
        }
    }

    #[test]
    fn publish_appends_in_order() {
        let r: Response<String, u32, char, ()> =
            Response::accept(1).publish(['a']).publish(['b', 'c']);
        assert_eq!(r.notifications, vec!['a', 'b', 'c']);
    }

    #[test]
    fn publish_on_rejection_skips_passing_decisions() {
        let r: Response<String, u32, char, ()> = Response::accept(1).publish_on_rejection(['x']);
        assert!(r.notifications.is_empty());
    }

    #[test]
    fn publish_on_rejection_appends_to_rejections() {
        let r: Response<&str, u32, char, ()> =
            Response::reject("no").publish_on_rejection(['x']);
        assert_eq!(r.notifications, vec!['x']);
    }

    #[test]
    fn reset_clears_the_log_only() {
        let r: Response<String, u32, char, ()> = Response::accept(1).publish(['a']).reset();
        assert!(r.notifications.is_empty());
        assert!(r.decision.is_accepted());
    }

    #[test]
    fn accepted_events_concatenate_across_and_then() {
        let r: Response<String, u32, char, ()> = Response::accept(1)
            .publish(['a'])
            .and_then(|()| Response::accept(2).publish(['b']));
        assert_eq!(r.decision.events(), &[1, 2]);
        assert_eq!(r.notifications, vec!['a', 'b']);
    }
}
