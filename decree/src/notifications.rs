//! Cross-stream wake-up feed.
//!
//! Storage drivers expose a unit tick for every durable commit; the outbox
//! processor and read-model projectors use it to wake instead of polling.
//! The feed carries no data on purpose: consumers that wake re-read their
//! source of truth, so a missed or coalesced tick costs latency, never
//! correctness.

use futures::stream::BoxStream;

/// Source of commit wake-ups.
pub trait NotificationsConsumer: Send + Sync {
    /// A fresh tick stream. Ticks may be coalesced under load; at least one
    /// tick follows every commit that happens after `listen` is called.
    fn listen(&self) -> BoxStream<'static, ()>;
}
