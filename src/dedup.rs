//! Bounded guard against re-alerting on redelivered events
//!
//! The bus redelivers every record whose offset was not committed before a
//! crash. Keys that already produced a notification are remembered for a
//! retention window so the redelivery commits silently instead.

use crate::events::Timestamp;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct DedupStore {
    /// key -> expiry
    entries: HashMap<String, Timestamp>,
    /// (expiry, key), ordered soonest first
    by_expiry: BTreeSet<(Timestamp, String)>,
}

impl DedupStore {
    fn remove(&mut self, key: &str) {
        if let Some(expires_at) = self.entries.remove(key) {
            self.by_expiry.remove(&(expires_at, key.to_string()));
        }
    }

    fn evict_expired(&mut self, now: Timestamp) {
        while let Some((expires_at, _)) = self.by_expiry.first() {
            if *expires_at > now {
                break;
            }
            if let Some((_, key)) = self.by_expiry.pop_first() {
                self.entries.remove(&key);
            }
        }
    }

    fn evict_soonest(&mut self) -> Option<String> {
        let (_, key) = self.by_expiry.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Shared, fixed-capacity record of recently handled event keys
///
/// `seen` and `remember` are individually atomic but not linearizable as a
/// pair: two workers racing on the same key may both observe `seen == false`.
/// That costs at most one duplicate notification.
#[derive(Debug)]
pub struct Deduplicator {
    store: Mutex<DedupStore>,
    window: Duration,
    capacity: usize,
}

impl Deduplicator {
    /// Create a deduplicator
    ///
    /// # Arguments
    ///
    /// * `window` - How long a remembered key suppresses redeliveries
    /// * `capacity` - Maximum number of keys held at once
    pub fn new(window: std::time::Duration, capacity: usize) -> Self {
        let window = Duration::from_std(window).unwrap_or_else(|_| Duration::days(365));
        Self {
            store: Mutex::new(DedupStore::default()),
            window,
            capacity: capacity.max(1),
        }
    }

    /// Whether `key` was remembered and has not yet expired
    pub fn seen(&self, key: &str) -> bool {
        self.seen_at(key, Utc::now())
    }

    /// `seen` evaluated at an explicit time
    pub fn seen_at(&self, key: &str, now: Timestamp) -> bool {
        let store = self.lock();
        store
            .entries
            .get(key)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Mark `key` as handled until now + window
    pub fn remember(&self, key: &str) {
        self.remember_at(key, Utc::now());
    }

    /// `remember` evaluated at an explicit time
    ///
    /// Remembering a key again refreshes its expiry. When the store is full
    /// the entry closest to expiring is dropped.
    pub fn remember_at(&self, key: &str, now: Timestamp) {
        let expires_at = now
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut store = self.lock();

        store.evict_expired(now);
        store.remove(key);

        while store.entries.len() >= self.capacity {
            match store.evict_soonest() {
                Some(evicted) => debug!("Dedup store full, evicted key '{}'", evicted),
                None => break,
            }
        }

        store.entries.insert(key.to_string(), expires_at);
        store.by_expiry.insert((expires_at, key.to_string()));
    }

    /// Number of entries currently held, expired or not
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DedupStore> {
        // A poisoned store still holds consistent entries; keep serving it.
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
