//! Keyed exclusive locks with bounded waits
//!
//! The ledger serializes every mutation of a user's balances behind
//! `user:<wallet>` and every touch of the current-epoch row behind
//! `epoch:current`. Acquisition never blocks past the configured timeout;
//! callers get [`LedgerError::Busy`] and may retry.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::error::{LedgerError, Result};

pub const CURRENT_EPOCH_KEY: &str = "epoch:current";

pub fn user_key(wallet: &str) -> String {
    format!("user:{}", wallet)
}

pub struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire `key`, waiting at most the table timeout
    pub fn acquire(&self, key: impl Into<String>) -> Result<KeyGuard<'_>> {
        let key = key.into();
        let deadline = Instant::now() + self.timeout;

        let mut held = self.held.lock();
        while held.contains(&key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(&key) {
                warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "Lock acquisition timed out");
                return Err(LedgerError::Busy(key));
            }
        }
        held.insert(key.clone());
        trace!(key = %key, "Lock acquired");

        Ok(KeyGuard { table: self, key })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

/// Releases its key on drop, on every exit path
pub struct KeyGuard<'a> {
    table: &'a LockTable,
    key: String,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.table.held.lock().remove(&self.key);
        self.table.released.notify_all();
        trace!(key = %self.key, "Lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_distinct_keys_do_not_contend() {
        let table = LockTable::new(Duration::from_millis(50));
        let _a = table.acquire(user_key("alice")).unwrap();
        let _b = table.acquire(user_key("bob")).unwrap();
        assert!(table.is_held("user:alice"));
        assert!(table.is_held("user:bob"));
    }

    #[test]
    fn test_same_key_times_out_with_busy() {
        let table = LockTable::new(Duration::from_millis(20));
        let _guard = table.acquire(CURRENT_EPOCH_KEY).unwrap();
        let result = table.acquire(CURRENT_EPOCH_KEY);
        assert!(matches!(result, Err(LedgerError::Busy(ref k)) if k == CURRENT_EPOCH_KEY));
    }

    #[test]
    fn test_release_on_drop_wakes_waiter() {
        let table = Arc::new(LockTable::new(Duration::from_secs(2)));
        let guard = table.acquire(user_key("alice")).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.acquire(user_key("alice")).map(|g| g.key().to_string()))
        };

        thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert_eq!(waiter.join().unwrap().unwrap(), "user:alice");
        assert!(!table.is_held("user:alice"));
    }
}
