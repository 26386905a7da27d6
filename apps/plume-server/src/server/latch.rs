use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use plume_core::{GuildId, LatchState, MemberId, SystemId};

use super::clock::{duration_millis, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchLookup {
    Empty,
    Expired(MemberId),
    Active(MemberId),
}

#[derive(Debug, Clone, Copy)]
struct LatchEntry {
    state: LatchState,
    timeout: Option<Duration>,
}

/// Last proxied member per (system, guild).
pub struct LatchTracker {
    entries: RwLock<HashMap<(SystemId, GuildId), LatchEntry>>,
    clock: Arc<dyn Clock>,
}

impl LatchTracker {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Record `member` as the latest speaker. `timeout` is kept for pruning.
    pub fn record(
        &self,
        system: SystemId,
        guild: GuildId,
        member: MemberId,
        timeout: Option<Duration>,
    ) {
        let state = LatchState {
            system_id: system,
            guild_id: guild,
            last_proxied_member: member,
            last_proxied_at_millis: self.clock.now_millis(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((system, guild), LatchEntry { state, timeout });
    }

    /// Latched member, still valid while `now - last <= timeout`.
    /// A `None` timeout never expires.
    pub fn lookup(
        &self,
        system: SystemId,
        guild: GuildId,
        timeout: Option<Duration>,
    ) -> LatchLookup {
        let Some(state) = self.get(system, guild) else {
            return LatchLookup::Empty;
        };
        if is_expired(&state, timeout, self.clock.now_millis()) {
            LatchLookup::Expired(state.last_proxied_member)
        } else {
            LatchLookup::Active(state.last_proxied_member)
        }
    }

    #[must_use]
    pub fn get(&self, system: SystemId, guild: GuildId) -> Option<LatchState> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(system, guild))
            .map(|entry| entry.state)
    }

    /// Drop latches that outlived the timeout they were recorded with.
    pub(crate) fn prune_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let stale: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| is_expired(&entry.state, entry.timeout, now))
            .map(|(key, _)| *key)
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut pruned = 0;
        for key in stale {
            if entries
                .get(&key)
                .is_some_and(|entry| is_expired(&entry.state, entry.timeout, now))
            {
                entries.remove(&key);
                pruned += 1;
            }
        }
        pruned
    }
}

fn is_expired(state: &LatchState, timeout: Option<Duration>, now: i64) -> bool {
    timeout.is_some_and(|timeout| {
        now.saturating_sub(state.last_proxied_at_millis) > duration_millis(timeout)
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use plume_core::{GuildId, MemberId, SystemId};

    use super::{LatchLookup, LatchTracker};
    use crate::server::clock::ManualClock;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(60));

    fn tracker() -> (Arc<ManualClock>, LatchTracker) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (clock.clone(), LatchTracker::new(clock))
    }

    #[test]
    fn empty_until_recorded() {
        let (_clock, latch) = tracker();
        assert_eq!(
            latch.lookup(SystemId::new(1), GuildId::new(2), TIMEOUT),
            LatchLookup::Empty
        );
    }

    #[test]
    fn elapsed_equal_to_timeout_is_still_valid() {
        let (clock, latch) = tracker();
        latch.record(SystemId::new(1), GuildId::new(2), MemberId::new(3), TIMEOUT);
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            latch.lookup(SystemId::new(1), GuildId::new(2), TIMEOUT),
            LatchLookup::Active(MemberId::new(3))
        );
        clock.advance(Duration::from_millis(1));
        assert_eq!(
            latch.lookup(SystemId::new(1), GuildId::new(2), TIMEOUT),
            LatchLookup::Expired(MemberId::new(3))
        );
    }

    #[test]
    fn no_timeout_never_expires() {
        let (clock, latch) = tracker();
        latch.record(SystemId::new(1), GuildId::new(2), MemberId::new(3), None);
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(
            latch.lookup(SystemId::new(1), GuildId::new(2), None),
            LatchLookup::Active(MemberId::new(3))
        );
        assert_eq!(latch.prune_expired(), 0);
    }

    #[test]
    fn latches_are_per_guild() {
        let (_clock, latch) = tracker();
        latch.record(SystemId::new(1), GuildId::new(2), MemberId::new(3), TIMEOUT);
        assert_eq!(
            latch.lookup(SystemId::new(1), GuildId::new(9), TIMEOUT),
            LatchLookup::Empty
        );
    }

    #[test]
    fn prune_uses_recorded_timeout() {
        let (clock, latch) = tracker();
        latch.record(SystemId::new(1), GuildId::new(2), MemberId::new(3), TIMEOUT);
        latch.record(SystemId::new(1), GuildId::new(4), MemberId::new(3), None);
        clock.advance(Duration::from_secs(61));
        assert_eq!(latch.prune_expired(), 1);
        assert!(latch.get(SystemId::new(1), GuildId::new(2)).is_none());
        assert!(latch.get(SystemId::new(1), GuildId::new(4)).is_some());
    }
}
