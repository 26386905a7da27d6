use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use plume_core::RelayId;
use plume_protocol::RateLimitHeaders;

use super::clock::{duration_millis, Clock};

const UNKNOWN: i64 = -1;
const TOO_MANY_REQUESTS: u16 = 429;
/// Buckets whose window ended this long ago are dropped by [`RateLimiter::sweep`].
const BUCKET_RETENTION: Duration = Duration::from_secs(60 * 60);

struct Bucket {
    remaining: AtomicI64,
    max_limit: AtomicI64,
    reset_at: AtomicI64,
    reset_expired: AtomicBool,
}

impl Bucket {
    fn unknown(now: i64) -> Self {
        Self {
            remaining: AtomicI64::new(UNKNOWN),
            max_limit: AtomicI64::new(UNKNOWN),
            reset_at: AtomicI64::new(now),
            reset_expired: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self, now: i64) -> bool {
        if now > self.reset_at.load(Ordering::Acquire)
            && self
                .reset_expired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.remaining
                .store(self.max_limit.load(Ordering::Acquire), Ordering::Release);
        }

        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == UNKNOWN {
                return true;
            }
            if current <= 0 {
                return false;
            }
            match self.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn observe(&self, now: i64, status: u16, headers: &RateLimitHeaders) {
        if let Some(limit) = headers.limit {
            self.max_limit.store(limit, Ordering::Release);
        }

        if let Some(reset_after) = headers.reset_after {
            let reset_at = now.saturating_add(duration_millis(reset_after));
            let previous = self.reset_at.fetch_max(reset_at, Ordering::AcqRel);
            if reset_at > previous {
                self.reset_expired.store(false, Ordering::Release);
            }
        }

        if status == TOO_MANY_REQUESTS {
            self.remaining.store(0, Ordering::Release);
            return;
        }

        if let Some(reported) = headers.remaining {
            let mut current = self.remaining.load(Ordering::Acquire);
            loop {
                let next = if current == UNKNOWN {
                    reported
                } else {
                    current.min(reported)
                };
                if next == current {
                    break;
                }
                match self.remaining.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }
}

/// Per-relay send budget learned from upstream rate-limit headers.
pub struct RateLimiter {
    buckets: RwLock<HashMap<RelayId, Arc<Bucket>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Take one send from `relay`'s budget. Relays never seen before are allowed.
    pub fn try_acquire(&self, relay: RelayId) -> bool {
        let now = self.clock.now_millis();
        self.bucket(relay, now).try_acquire(now)
    }

    /// Fold a response's status and headers into `relay`'s bucket.
    pub fn update_from_response(&self, relay: RelayId, status: u16, headers: &RateLimitHeaders) {
        if headers.is_empty() && status != TOO_MANY_REQUESTS {
            return;
        }
        let now = self.clock.now_millis();
        self.bucket(relay, now).observe(now, status, headers);
    }

    /// Remaining sends, or `None` while the budget is unknown.
    #[must_use]
    pub fn remaining(&self, relay: RelayId) -> Option<i64> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&relay)
            .map(|bucket| bucket.remaining.load(Ordering::Acquire))
            .filter(|remaining| *remaining != UNKNOWN)
    }

    /// Evict buckets whose window ended over an hour ago.
    pub(crate) fn sweep(&self) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_millis(BUCKET_RETENTION));
        let stale = |bucket: &Bucket| bucket.reset_at.load(Ordering::Acquire) < cutoff;

        let candidates: Vec<RelayId> = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, bucket)| stale(bucket))
            .map(|(relay, _)| *relay)
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = 0;
        for relay in candidates {
            if buckets.get(&relay).is_some_and(|bucket| stale(bucket)) {
                buckets.remove(&relay);
                evicted += 1;
            }
        }
        evicted
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn bucket(&self, relay: RelayId, now: i64) -> Arc<Bucket> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&relay)
        {
            return bucket.clone();
        }
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(relay)
            .or_insert_with(|| Arc::new(Bucket::unknown(now)))
            .clone()
    }
}
