use std::sync::Arc;

use plume_core::{
    relay_username, truncate_chars, Attachment, ChannelId, MessageId, RelayId,
    MAX_RELAY_CONTENT_CHARS,
};
use plume_protocol::{AllowedMentions, UNKNOWN_WEBHOOK};

use super::{
    metrics::ProxyMetrics,
    rate_limit::RateLimiter,
    relay_registry::{RelayError, RelayRegistry},
    transport::{RelayExecution, RelayResponseBody, RelayTransport, TransportError},
};

/// A stale endpoint is retried once on a fresh relay.
const MAX_ATTEMPTS: u32 = 2;

const FORBIDDEN: u16 = 403;
const NOT_FOUND: u16 = 404;
const TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: ChannelId,
    pub username: String,
    pub avatar_url: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub allow_broad_mentions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub relay_message_id: MessageId,
    pub relay_id: RelayId,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("relay is rate limited")]
    RateLimited,
    #[error("relay endpoint is stale")]
    StaleEndpoint,
    #[error("missing permissions in the target channel")]
    MissingPermissions,
    #[error("relay rejected the message with status {status}")]
    Upstream { status: u16, code: Option<u32> },
    #[error("relay transport failed: {0}")]
    Transient(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl DispatchError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::StaleEndpoint => "stale_endpoint",
            Self::MissingPermissions => "missing_permissions",
            Self::Upstream { .. } => "upstream",
            Self::Transient(_) => "transient",
            Self::Relay(RelayError::LimitReached { .. }) => "relay_limit",
            Self::Relay(_) => "relay",
        }
    }
}

impl From<TransportError> for DispatchError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Status { status, code, .. } => status_error(status, code),
            other => Self::Transient(other.to_string()),
        }
    }
}

fn status_error(status: u16, code: Option<u32>) -> DispatchError {
    match status {
        TOO_MANY_REQUESTS => DispatchError::RateLimited,
        FORBIDDEN => DispatchError::MissingPermissions,
        NOT_FOUND if code == Some(UNKNOWN_WEBHOOK) => DispatchError::StaleEndpoint,
        _ => DispatchError::Upstream { status, code },
    }
}

/// Sends one message through the channel's relay, honouring its rate limit.
pub struct Dispatcher {
    registry: Arc<RelayRegistry>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn RelayTransport>,
    metrics: Arc<ProxyMetrics>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<RelayRegistry>,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn RelayTransport>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            registry,
            limiter,
            transport,
            metrics,
        }
    }

    /// # Errors
    /// Returns [`DispatchError`] when the relay refuses, the budget is spent,
    /// or the endpoint is still stale after one retry.
    pub async fn send(&self, message: OutboundMessage) -> Result<Delivery, DispatchError> {
        let channel = message.channel_id;
        let execution = execution_for(message);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let relay = self.registry.get_or_create(channel).await?;
            if !self.limiter.try_acquire(relay.id) {
                self.metrics.record_rate_limit_denial();
                tracing::info!(
                    event = "proxy.dispatch",
                    outcome = "rate_limited",
                    channel_id = %channel,
                    relay_id = %relay.id
                );
                return Err(DispatchError::RateLimited);
            }

            let exchange = self.transport.execute_relay(&relay, &execution).await?;
            self.limiter
                .update_from_response(relay.id, exchange.status, &exchange.rate_limit);

            let error = match exchange.body {
                RelayResponseBody::Delivered(posted) => {
                    if posted.channel_id.get() != channel.get() {
                        tracing::warn!(
                            event = "proxy.dispatch",
                            outcome = "relay_moved",
                            channel_id = %channel,
                            reported_channel_id = %posted.channel_id
                        );
                        self.registry.invalidate(channel);
                    }
                    return Ok(Delivery {
                        relay_message_id: MessageId::new(posted.id.get()),
                        relay_id: relay.id,
                        attempts,
                    });
                }
                RelayResponseBody::Unreadable => {
                    tracing::warn!(
                        event = "proxy.dispatch",
                        outcome = "unreadable_response",
                        channel_id = %channel,
                        relay_id = %relay.id
                    );
                    return Err(DispatchError::Transient(TransportError::Decode.to_string()));
                }
                RelayResponseBody::Rejected(body) => {
                    status_error(exchange.status, body.map(|body| body.code))
                }
            };

            if error != DispatchError::StaleEndpoint {
                return Err(error);
            }
            self.registry.invalidate(channel);
            if attempts >= MAX_ATTEMPTS {
                tracing::warn!(event = "proxy.dispatch", outcome = "stale_twice", channel_id = %channel);
                return Err(error);
            }
            self.metrics.record_stale_retry();
            tracing::info!(event = "proxy.dispatch", outcome = "stale_retry", channel_id = %channel);
        }
    }
}

fn execution_for(message: OutboundMessage) -> RelayExecution {
    let mut content = message.content;
    truncate_chars(&mut content, MAX_RELAY_CONTENT_CHARS);
    RelayExecution {
        username: relay_username(&message.username),
        avatar_url: message.avatar_url,
        content,
        attachments: message.attachments,
        allowed_mentions: AllowedMentions::for_sender(message.allow_broad_mentions),
    }
}

#[cfg(test)]
mod tests {
    use plume_core::{ChannelId, MAX_RELAY_CONTENT_CHARS};
    use plume_protocol::{MentionKind, UNKNOWN_WEBHOOK};

    use super::{execution_for, status_error, DispatchError, OutboundMessage};

    #[test]
    fn statuses_map_to_typed_errors() {
        assert_eq!(status_error(429, None), DispatchError::RateLimited);
        assert_eq!(status_error(403, Some(50013)), DispatchError::MissingPermissions);
        assert_eq!(
            status_error(404, Some(UNKNOWN_WEBHOOK)),
            DispatchError::StaleEndpoint
        );
        assert_eq!(
            status_error(404, Some(10003)),
            DispatchError::Upstream {
                status: 404,
                code: Some(10003)
            }
        );
        assert_eq!(
            status_error(500, None),
            DispatchError::Upstream {
                status: 500,
                code: None
            }
        );
    }

    #[test]
    fn execution_sanitises_username_and_content() {
        let execution = execution_for(OutboundMessage {
            channel_id: ChannelId::new(7),
            username: String::from("Clyde"),
            avatar_url: None,
            content: "x".repeat(MAX_RELAY_CONTENT_CHARS + 10),
            attachments: Vec::new(),
            allow_broad_mentions: false,
        });
        assert_eq!(execution.username, "C\u{200A}lyde");
        assert_eq!(execution.content.chars().count(), MAX_RELAY_CONTENT_CHARS);
        assert!(!execution
            .allowed_mentions
            .parse
            .contains(&MentionKind::Everyone));
    }
}
