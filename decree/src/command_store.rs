//! Bounded cache of already-processed command ids.
//!
//! This cache is an optimisation, not the guard: the journal's unique index
//! on the command id is what actually enforces idempotency. A hit here lets
//! the handler skip the round-trip entirely; a miss on a replayed command
//! just means the driver reports the duplicate instead.

use crate::types::CommandId;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Fixed-capacity set of processed command ids with least-recent-insertion
/// eviction.
///
/// `contains` does not refresh an entry's position, so entries age out in
/// insertion order regardless of how often they are checked.
pub struct CommandIdCache {
    cache: Mutex<LruCache<CommandId, ()>>,
}

impl CommandIdCache {
    /// Creates a cache remembering at most `capacity` command ids.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is clamped to at least 1");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// True when the command id is still remembered.
    pub fn contains(&self, id: &CommandId) -> bool {
        self.cache
            .lock()
            .expect("command cache lock poisoned")
            .contains(id)
    }

    /// Remembers a command id, evicting the oldest entry when full.
    pub fn add(&self, id: CommandId) {
        self.cache
            .lock()
            .expect("command cache lock poisoned")
            .put(id, ());
    }
}
