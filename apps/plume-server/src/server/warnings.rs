use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use plume_core::ChannelId;

use super::clock::{duration_millis, Clock};

/// At most one user-facing warning per channel per interval.
pub struct WarningThrottle {
    interval: Duration,
    last_sent: RwLock<HashMap<ChannelId, i64>>,
    clock: Arc<dyn Clock>,
}

impl WarningThrottle {
    pub(crate) fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            last_sent: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Claims the channel's warning slot. Returns false while the previous
    /// warning is still inside the interval.
    pub fn try_claim(&self, channel: ChannelId) -> bool {
        let now = self.clock.now_millis();
        let interval = duration_millis(self.interval);
        let mut last_sent = self.last_sent.write().unwrap_or_else(PoisonError::into_inner);
        match last_sent.get(&channel) {
            Some(previous) if now.saturating_sub(*previous) < interval => false,
            _ => {
                last_sent.insert(channel, now);
                true
            }
        }
    }

    pub(crate) fn prune(&self) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_millis(self.interval));
        let mut last_sent = self.last_sent.write().unwrap_or_else(PoisonError::into_inner);
        let before = last_sent.len();
        last_sent.retain(|_, sent| *sent > cutoff);
        before - last_sent.len()
    }
}
