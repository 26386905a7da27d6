use std::{
    collections::HashMap,
    hash::Hash,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use super::clock::{duration_millis, Clock};

/// Sliding plus absolute expiry. An entry is dead once it has been idle for
/// longer than `sliding` or alive for longer than `absolute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub sliding: Duration,
    pub absolute: Duration,
}

impl Expiry {
    #[must_use]
    pub const fn new(sliding: Duration, absolute: Duration) -> Self {
        Self { sliding, absolute }
    }

    fn is_expired(&self, inserted_at: i64, last_access: i64, now: i64) -> bool {
        now.saturating_sub(last_access) > duration_millis(self.sliding)
            || now.saturating_sub(inserted_at) > duration_millis(self.absolute)
    }
}

struct Entry<V> {
    value: V,
    expiry: Expiry,
    inserted_at: i64,
    last_access: AtomicI64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: i64) -> bool {
        self.expiry
            .is_expired(self.inserted_at, self.last_access.load(Ordering::Relaxed), now)
    }
}

/// Read-mostly map whose entries carry their own [`Expiry`].
///
/// Reads touch the sliding window under the shared lock; expired entries are
/// invisible to readers and dropped by [`ExpiringCache::purge_expired`].
pub(crate) struct ExpiringCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.last_access.store(now, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub(crate) fn insert(&self, key: K, value: V, expiry: Expiry) {
        let now = self.clock.now_millis();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Self::entry(value, expiry, now));
    }

    /// Returns the live value for `key`, inserting `make()` when absent or expired.
    pub(crate) fn get_or_insert_with(&self, key: K, expiry: Expiry, make: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let now = self.clock.now_millis();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(&key).filter(|entry| !entry.is_expired(now)) {
            entry.last_access.store(now, Ordering::Relaxed);
            return entry.value.clone();
        }
        let value = make();
        entries.insert(key, Self::entry(value.clone(), expiry, now));
        value
    }

    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Removes `key` only while `predicate` holds for the stored value.
    pub(crate) fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|entry| predicate(&entry.value)) {
            entries.remove(key);
            return true;
        }
        false
    }

    pub(crate) fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, entry| keep(key, &entry.value));
    }

    /// Drops every expired entry and returns how many went.
    pub(crate) fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn entry(value: V, expiry: Expiry, now: i64) -> Entry<V> {
        Entry {
            value,
            expiry,
            inserted_at: now,
            last_access: AtomicI64::new(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{ExpiringCache, Expiry};
    use crate::server::clock::ManualClock;

    const POLICY: Expiry = Expiry::new(Duration::from_secs(60), Duration::from_secs(300));

    fn cache() -> (Arc<ManualClock>, ExpiringCache<u64, &'static str>) {
        let clock = Arc::new(ManualClock::new(0));
        let cache = ExpiringCache::new(clock.clone());
        (clock, cache)
    }

    #[test]
    fn sliding_window_extends_on_read() {
        let (clock, cache) = cache();
        cache.insert(1, "a", POLICY);
        for _ in 0..4 {
            clock.advance(Duration::from_secs(50));
            assert_eq!(cache.get(&1), Some("a"));
        }
    }

    #[test]
    fn idle_entries_expire() {
        let (clock, cache) = cache();
        cache.insert(1, "a", POLICY);
        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get(&1), Some("a"));
        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn absolute_cap_wins_over_reads() {
        let (clock, cache) = cache();
        cache.insert(1, "a", POLICY);
        for _ in 0..7 {
            clock.advance(Duration::from_secs(50));
            let _ = cache.get(&1);
        }
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn get_or_insert_replaces_expired_value() {
        let (clock, cache) = cache();
        assert_eq!(cache.get_or_insert_with(1, POLICY, || "first"), "first");
        assert_eq!(cache.get_or_insert_with(1, POLICY, || "second"), "first");
        clock.advance(Duration::from_secs(400));
        assert_eq!(cache.get_or_insert_with(1, POLICY, || "third"), "third");
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let (clock, cache) = cache();
        let short = Expiry::new(Duration::from_secs(1), Duration::from_secs(1));
        cache.insert(1, "short", short);
        cache.insert(2, "long", POLICY);
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some("long"));
    }

    #[test]
    fn remove_if_checks_the_stored_value() {
        let (_clock, cache) = cache();
        cache.insert(1, "a", POLICY);
        assert!(!cache.remove_if(&1, |value| *value == "b"));
        assert!(cache.remove_if(&1, |value| *value == "a"));
        assert_eq!(cache.remove(&1), None);
    }
}
