use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use plume_core::{ChannelId, InboundMessage};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{metrics::ProxyMetrics, orchestrator::ProxyOrchestrator};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("lane for channel {channel_id} is full")]
pub struct LaneFull {
    pub channel_id: ChannelId,
}

struct Lane {
    id: u64,
    sender: mpsc::Sender<InboundMessage>,
}

/// One ordered queue per active channel, each drained by its own worker.
pub struct ChannelLanes {
    orchestrator: Arc<ProxyOrchestrator>,
    metrics: Arc<ProxyMetrics>,
    capacity: usize,
    idle_timeout: Duration,
    lanes: Mutex<HashMap<ChannelId, Lane>>,
    next_lane_id: AtomicU64,
}

impl ChannelLanes {
    pub(crate) fn new(
        orchestrator: Arc<ProxyOrchestrator>,
        metrics: Arc<ProxyMetrics>,
        capacity: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            metrics,
            capacity: capacity.max(1),
            idle_timeout,
            lanes: Mutex::new(HashMap::new()),
            next_lane_id: AtomicU64::new(0),
        }
    }

    /// Queue `message` behind earlier messages from the same channel.
    ///
    /// # Errors
    /// Returns [`LaneFull`] when the channel's queue is at capacity; the
    /// message is dropped.
    pub fn submit(self: &Arc<Self>, message: InboundMessage) -> Result<(), LaneFull> {
        let channel = message.channel_id;
        let mut lanes = self.lock();

        let message = match lanes.get(&channel) {
            Some(lane) => match lane.sender.try_send(message) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.metrics.record_lane_drop("full");
                    tracing::warn!(event = "lane.submit", outcome = "dropped", channel_id = %channel);
                    return Err(LaneFull {
                        channel_id: channel,
                    });
                }
                Err(TrySendError::Closed(message)) => message,
            },
            None => message,
        };

        let (sender, receiver) = mpsc::channel(self.capacity);
        if sender.try_send(message).is_err() {
            self.metrics.record_lane_drop("closed");
            return Err(LaneFull {
                channel_id: channel,
            });
        }
        let id = self.next_lane_id.fetch_add(1, Ordering::Relaxed);
        lanes.insert(channel, Lane { id, sender });
        drop(lanes);

        tracing::debug!(event = "lane.open", channel_id = %channel, lane_id = id);
        tokio::spawn(self.clone().drain(channel, id, receiver));
        Ok(())
    }

    #[must_use]
    pub fn active_lanes(&self) -> usize {
        self.lock().len()
    }

    async fn drain(
        self: Arc<Self>,
        channel: ChannelId,
        lane_id: u64,
        mut receiver: mpsc::Receiver<InboundMessage>,
    ) {
        loop {
            let message = match tokio::time::timeout(self.idle_timeout, receiver.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return,
                Err(_) => match self.retire(channel, lane_id, &mut receiver) {
                    Some(message) => message,
                    None => {
                        tracing::debug!(event = "lane.close", channel_id = %channel, lane_id);
                        return;
                    }
                },
            };
            // Outcomes are logged and counted by the orchestrator.
            let _ = self.orchestrator.handle(message).await;
        }
    }

    /// Removes the lane unless a message slipped in before the lock was taken.
    fn retire(
        &self,
        channel: ChannelId,
        lane_id: u64,
        receiver: &mut mpsc::Receiver<InboundMessage>,
    ) -> Option<InboundMessage> {
        let mut lanes = self.lock();
        if let Ok(message) = receiver.try_recv() {
            return Some(message);
        }
        if lanes.get(&channel).is_some_and(|lane| lane.id == lane_id) {
            lanes.remove(&channel);
        }
        None
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
