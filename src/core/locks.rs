//! Per-rule mutation locks
//!
//! Add and delete are check-then-act sequences against the backend. Two calls
//! for the same canonical key must not interleave, while calls for different
//! keys should never wait on each other. Entries are created on demand and
//! reclaimed by the last guard for a key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other guard for `key` is alive.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = {
            let mut table = self.table.lock();
            if let Some(existing) = table.get(key).and_then(Weak::upgrade) {
                existing
            } else {
                let fresh = Arc::new(AsyncMutex::new(()));
                table.insert(key.to_string(), Arc::downgrade(&fresh));
                fresh
            }
        };

        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Number of keys with a live guard or waiter.
    pub fn active(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// Held for the duration of one mutation
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex (and our strong ref) before inspecting the table.
        self.guard.take();

        let mut table = self.locks.table.lock();
        if table.get(&self.key).is_some_and(|w| w.strong_count() == 0) {
            table.remove(&self.key);
        }
    }
}
