//! Per-key mutual exclusion with bounded waits.
//!
//! Each source id is its own lock: holders of different keys never wait on
//! each other, and a waiter on a busy key gives up at its deadline instead of
//! blocking forever. Keys are tracked only while held, so the table stays as
//! small as the number of in-flight transactions.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// A set of named locks created on demand.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Scoped hold on one key; releases on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    owner: &'a KeyedMutex,
    key: String,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.owner.held.lock().remove(&self.key);
        self.owner.released.notify_all();
    }
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `key`, waiting at most `timeout`.
    ///
    /// Returns `None` if the key is still held when the deadline passes.
    pub fn acquire(&self, key: &str, timeout: Duration) -> Option<KeyGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();

        while held.contains(key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(key) {
                tracing::debug!(key = %key, ?timeout, "Key lock wait timed out");
                return None;
            }
        }

        held.insert(key.to_string());
        Some(KeyGuard {
            owner: self,
            key: key.to_string(),
        })
    }

    /// Number of keys currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}
