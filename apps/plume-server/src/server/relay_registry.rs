use std::sync::Arc;

use plume_core::{ChannelId, RelayId};
use plume_protocol::{RelayWebhook, MAX_RELAYS_PER_CHANNEL};
use tokio::sync::OnceCell;

use super::{
    clock::Clock,
    expiry::{ExpiringCache, Expiry},
    transport::{RelayHandle, RelayTransport, TransportError},
};

const MAX_RESOLVE_ATTEMPTS: usize = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("channel {channel_id} already holds {count} relays")]
    LimitReached { channel_id: ChannelId, count: usize },
    #[error("relay for channel {channel_id} keeps reporting another channel")]
    ChannelMismatch { channel_id: ChannelId },
    #[error("created relay came back without a token")]
    MissingToken,
}

type Slot = Arc<OnceCell<RelayHandle>>;

/// One relay endpoint per channel, created at most once at a time.
pub struct RelayRegistry {
    transport: Arc<dyn RelayTransport>,
    relay_name: String,
    application_id: u64,
    expiry: Expiry,
    slots: ExpiringCache<ChannelId, Slot>,
}

impl RelayRegistry {
    pub(crate) fn new(
        transport: Arc<dyn RelayTransport>,
        clock: Arc<dyn Clock>,
        relay_name: String,
        application_id: u64,
        expiry: Expiry,
    ) -> Self {
        Self {
            transport,
            relay_name,
            application_id,
            expiry,
            slots: ExpiringCache::new(clock),
        }
    }

    /// Handle for `channel`, reusing our own relay or creating one.
    ///
    /// Concurrent callers for the same channel share a single creation. A failed
    /// creation leaves the slot empty so the next caller tries again.
    ///
    /// # Errors
    /// Returns [`RelayError`] when the relay cannot be listed, created, or keeps
    /// pointing at a different channel.
    pub async fn get_or_create(&self, channel: ChannelId) -> Result<RelayHandle, RelayError> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let slot = self
                .slots
                .get_or_insert_with(channel, self.expiry, || Arc::new(OnceCell::new()));
            let handle = slot
                .get_or_try_init(|| self.resolve(channel))
                .await?
                .clone();
            if handle.channel_id == channel {
                return Ok(handle);
            }

            tracing::warn!(
                event = "relay.drift",
                channel_id = %channel,
                relay_id = %handle.id,
                reported_channel_id = %handle.channel_id
            );
            self.slots
                .remove_if(&channel, |current| Arc::ptr_eq(current, &slot));
        }
        Err(RelayError::ChannelMismatch {
            channel_id: channel,
        })
    }

    /// Forget the relay for `channel`; the next send resolves it again.
    pub fn invalidate(&self, channel: ChannelId) {
        if self.slots.remove(&channel).is_some() {
            tracing::info!(event = "relay.invalidate", channel_id = %channel);
        }
    }

    pub(crate) fn purge_expired(&self) -> usize {
        self.slots.purge_expired()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    async fn resolve(&self, channel: ChannelId) -> Result<RelayHandle, RelayError> {
        let relays = self.transport.list_relays(channel).await?;
        if let Some(owned) = relays.iter().find(|relay| self.owns(relay)) {
            tracing::info!(event = "relay.resolve", outcome = "reused", channel_id = %channel);
            return handle_for(owned);
        }
        if relays.len() >= MAX_RELAYS_PER_CHANNEL {
            tracing::warn!(
                event = "relay.resolve",
                outcome = "limit_reached",
                channel_id = %channel,
                count = relays.len()
            );
            return Err(RelayError::LimitReached {
                channel_id: channel,
                count: relays.len(),
            });
        }

        let created = self
            .transport
            .create_relay(channel, &self.relay_name)
            .await?;
        tracing::info!(event = "relay.resolve", outcome = "created", channel_id = %channel);
        handle_for(&created)
    }

    fn owns(&self, relay: &RelayWebhook) -> bool {
        relay.token.is_some()
            && relay.name.as_deref() == Some(self.relay_name.as_str())
            && relay.application_id.map(|id| id.get()) == Some(self.application_id)
    }
}

fn handle_for(relay: &RelayWebhook) -> Result<RelayHandle, RelayError> {
    let token = relay.token.clone().ok_or(RelayError::MissingToken)?;
    Ok(RelayHandle {
        id: RelayId::new(relay.id.get()),
        token,
        channel_id: ChannelId::new(relay.channel_id.get()),
    })
}
