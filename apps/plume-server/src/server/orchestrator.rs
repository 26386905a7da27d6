use std::{sync::Arc, time::Duration};

use plume_core::{
    compose_display_name, match_proxy_tags, neutralize_broad_mentions, resolve_avatar_url,
    validate_content_length, validate_display_name, AutoproxyMode, ChannelId, DomainError,
    GuildProxySettings, InboundMessage, Member, MemberId, MessageId, MessageMapping, System,
    MAX_RELAY_CONTENT_CHARS,
};
use tracing::Instrument;
use ulid::Ulid;

use super::{
    autoproxy::{AutoproxyDecision, AutoproxyRequest, AutoproxyResolver, AutoproxySkip},
    background::BackgroundTasks,
    clock::Clock,
    dispatch::{Delivery, DispatchError, Dispatcher, OutboundMessage},
    expiry::Expiry,
    latch::LatchTracker,
    member_cache::{MemberCache, MemberCachePolicy},
    metrics::ProxyMetrics,
    rate_limit::RateLimiter,
    relay_registry::{RelayError, RelayRegistry},
    repository::{Repository, RepositoryError},
    transport::RelayTransport,
    warnings::WarningThrottle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub relay_name: String,
    pub application_id: u64,
    pub cache_policy: MemberCachePolicy,
    pub relay_expiry: Expiry,
    pub display_name_min_chars: usize,
    pub display_name_max_chars: usize,
    pub max_attachment_bytes: u64,
    pub origin_delete_delay: Duration,
    pub warning_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    Tag,
    Autoproxy(AutoproxyMode),
}

impl MatchedBy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Autoproxy(AutoproxyMode::Off) => "autoproxy_off",
            Self::Autoproxy(AutoproxyMode::Front) => "autoproxy_front",
            Self::Autoproxy(AutoproxyMode::Latch) => "autoproxy_latch",
            Self::Autoproxy(AutoproxyMode::Member) => "autoproxy_member",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReceipt {
    pub relay_message_id: MessageId,
    pub member_id: MemberId,
    pub matched_by: MatchedBy,
    pub username: String,
    pub content: String,
}

/// Messages left alone. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BotAuthor,
    NoSystem,
    ChannelBlacklisted,
    ProxyDisabled,
    EmptyMessage,
    NoMatch(AutoproxySkip),
}

impl SkipReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BotAuthor => "bot_author",
            Self::NoSystem => "no_system",
            Self::ChannelBlacklisted => "channel_blacklisted",
            Self::ProxyDisabled => "proxy_disabled",
            Self::EmptyMessage => "empty_message",
            Self::NoMatch(reason) => reason.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    Proxied(ProxyReceipt),
    Skipped(SkipReason),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("missing permissions in the target channel")]
    Permission,
    #[error("relay is rate limited")]
    RateLimited,
    #[error("relay endpoint stayed stale after a retry")]
    StaleEndpoint,
    #[error("relay transport failed: {0}")]
    Transient(String),
    #[error("relay rejected the message with status {status}")]
    Upstream { status: u16, code: Option<u32> },
    #[error("channel {channel_id} has no free relay slot")]
    RelayLimit { channel_id: ChannelId },
    #[error(transparent)]
    Relay(RelayError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<DispatchError> for ProxyError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::RateLimited => Self::RateLimited,
            DispatchError::StaleEndpoint => Self::StaleEndpoint,
            DispatchError::MissingPermissions => Self::Permission,
            DispatchError::Upstream { status, code } => Self::Upstream { status, code },
            DispatchError::Transient(detail) => Self::Transient(detail),
            DispatchError::Relay(RelayError::LimitReached { channel_id, .. }) => {
                Self::RelayLimit { channel_id }
            }
            DispatchError::Relay(RelayError::Transport(error)) => {
                ProxyError::from(DispatchError::from(error))
            }
            DispatchError::Relay(other) => Self::Relay(other),
        }
    }
}

impl ProxyError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Permission => "permission",
            Self::RateLimited => "rate_limited",
            Self::StaleEndpoint => "stale_endpoint",
            Self::Transient(_) => "transient",
            Self::Upstream { .. } => "upstream",
            Self::RelayLimit { .. } => "relay_limit",
            Self::Relay(_) => "relay",
            Self::Repository(_) => "repository",
        }
    }

    /// Failures the sender can act on; these are reported in the channel.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Permission | Self::RelayLimit { .. }
        )
    }

    fn warning_text(&self) -> String {
        let detail = match self {
            Self::Validation(DomainError::DisplayNameTooShort { min, .. }) => {
                format!("the member's display name must be at least {min} characters long")
            }
            Self::Validation(DomainError::DisplayNameTooLong { max, actual }) => format!(
                "the member's display name (with system tag) is {actual} characters, the limit is {max}"
            ),
            Self::Validation(DomainError::ContentTooLong { max, .. }) => {
                format!("the message is longer than {max} characters")
            }
            Self::Validation(DomainError::AttachmentsTooLarge { max, .. }) => {
                format!("the attachments are larger than {max} bytes in total")
            }
            Self::Permission => {
                String::from("I am missing permissions to manage relays or messages in this channel")
            }
            Self::RelayLimit { .. } => {
                String::from("this channel already has the maximum number of relays")
            }
            other => other.to_string(),
        };
        format!("Could not proxy your message: {detail}.")
    }
}

/// Decides whether and as whom a message is proxied, then carries it out.
pub struct ProxyOrchestrator {
    config: OrchestratorConfig,
    repo: Arc<dyn Repository>,
    transport: Arc<dyn RelayTransport>,
    cache: MemberCache,
    latch: Arc<LatchTracker>,
    autoproxy: AutoproxyResolver,
    registry: Arc<RelayRegistry>,
    limiter: Arc<RateLimiter>,
    dispatcher: Dispatcher,
    warnings: WarningThrottle,
    background: BackgroundTasks,
    metrics: Arc<ProxyMetrics>,
}

impl ProxyOrchestrator {
    pub(crate) fn new(
        config: OrchestratorConfig,
        repo: Arc<dyn Repository>,
        transport: Arc<dyn RelayTransport>,
        clock: Arc<dyn Clock>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let cache = MemberCache::new(
            repo.clone(),
            clock.clone(),
            config.cache_policy,
            metrics.clone(),
        );
        let latch = Arc::new(LatchTracker::new(clock.clone()));
        let registry = Arc::new(RelayRegistry::new(
            transport.clone(),
            clock.clone(),
            config.relay_name.clone(),
            config.application_id,
            config.relay_expiry,
        ));
        let limiter = Arc::new(RateLimiter::new(clock.clone()));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            limiter.clone(),
            transport.clone(),
            metrics.clone(),
        );
        Self {
            autoproxy: AutoproxyResolver::new(repo.clone(), latch.clone()),
            warnings: WarningThrottle::new(config.warning_interval, clock),
            config,
            repo,
            transport,
            cache,
            latch,
            registry,
            limiter,
            dispatcher,
            background: BackgroundTasks::default(),
            metrics,
        }
    }

    pub fn cache(&self) -> &MemberCache {
        &self.cache
    }

    pub fn latch(&self) -> &LatchTracker {
        &self.latch
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub(crate) fn warnings(&self) -> &WarningThrottle {
        &self.warnings
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Proxy `message` if its author's system claims it.
    ///
    /// # Errors
    /// Returns [`ProxyError`] when a claimed message could not be relayed.
    /// Validation, permission and relay-limit failures have already been
    /// reported in the channel when this returns.
    pub async fn handle(&self, message: InboundMessage) -> Result<ProxyOutcome, ProxyError> {
        let span = tracing::info_span!(
            "proxy.attempt",
            attempt_id = %Ulid::new(),
            message_id = %message.message_id,
            channel_id = %message.channel_id,
            guild_id = %message.guild_id
        );
        let result = self.process(&message).instrument(span.clone()).await;
        span.in_scope(|| self.record_outcome(&result));
        result
    }

    fn record_outcome(&self, result: &Result<ProxyOutcome, ProxyError>) {
        match result {
            Ok(ProxyOutcome::Proxied(receipt)) => {
                self.metrics.record_proxied(receipt.matched_by.as_str());
                tracing::info!(
                    event = "proxy.message",
                    outcome = "proxied",
                    matched_by = receipt.matched_by.as_str(),
                    member_id = %receipt.member_id,
                    relay_message_id = %receipt.relay_message_id
                );
            }
            Ok(ProxyOutcome::Skipped(reason)) => {
                self.metrics.record_skipped(reason.as_str());
                tracing::debug!(
                    event = "proxy.message",
                    outcome = "skipped",
                    reason = reason.as_str()
                );
            }
            Err(error) => {
                self.metrics.record_failed(error.kind());
                tracing::warn!(
                    event = "proxy.message",
                    outcome = "failed",
                    kind = error.kind(),
                    error = %error
                );
            }
        }
    }

    async fn process(&self, message: &InboundMessage) -> Result<ProxyOutcome, ProxyError> {
        if message.author_is_bot {
            return Ok(ProxyOutcome::Skipped(SkipReason::BotAuthor));
        }
        let candidates = self
            .cache
            .candidates_for(message.author_account_id, message.guild_id)
            .await?;
        let Some(system) = candidates.system.as_ref() else {
            return Ok(ProxyOutcome::Skipped(SkipReason::NoSystem));
        };
        let settings = self
            .cache
            .guild_settings_for(message.guild_id, system.id)
            .await?;
        let channel_blacklisted = self
            .repo
            .is_channel_blacklisted(message.guild_id, message.channel_id)
            .await?;

        let tag_match = match_proxy_tags(
            &message.content,
            &candidates.members,
            system.case_sensitive_tags,
        )
        .filter(|found| !found.is_blank() || message.has_attachments());

        let (member, content, matched_by) = if let Some(found) = tag_match {
            let content = if found.member.keep_proxy {
                found.tagged_content()
            } else {
                found.stripped_content()
            };
            (found.member, content, MatchedBy::Tag)
        } else {
            let request = AutoproxyRequest {
                message,
                system,
                candidates: &candidates,
                settings: &settings,
                channel_blacklisted,
            };
            match self.autoproxy.resolve(&request).await? {
                AutoproxyDecision::Target(member) => (
                    member,
                    message.content.clone(),
                    MatchedBy::Autoproxy(settings.autoproxy_mode),
                ),
                AutoproxyDecision::Skip(reason) => {
                    return Ok(ProxyOutcome::Skipped(SkipReason::NoMatch(reason)))
                }
            }
        };

        if channel_blacklisted {
            return Ok(ProxyOutcome::Skipped(SkipReason::ChannelBlacklisted));
        }
        if !settings.proxy_enabled {
            return Ok(ProxyOutcome::Skipped(SkipReason::ProxyDisabled));
        }
        if content.trim().is_empty() && !message.has_attachments() {
            return Ok(ProxyOutcome::Skipped(SkipReason::EmptyMessage));
        }

        // Length is checked on the text as sent, after mentions are neutralized.
        let content = if message.has_broad_mention_permission {
            content
        } else {
            neutralize_broad_mentions(&content).into_owned()
        };
        let username = compose_display_name(member, system, &settings);
        if let Err(error) = self.validate(&username, &content, message) {
            let error = ProxyError::from(error);
            self.warn_channel(message.channel_id, &error).await;
            return Err(error);
        }

        let outbound = OutboundMessage {
            channel_id: message.channel_id,
            username: username.clone(),
            avatar_url: resolve_avatar_url(member, system).map(str::to_owned),
            content: content.clone(),
            attachments: message.attachments.clone(),
            allow_broad_mentions: message.has_broad_mention_permission,
        };
        let delivery = match self.dispatcher.send(outbound).await {
            Ok(delivery) => delivery,
            Err(error) => {
                let error = ProxyError::from(error);
                if error.is_user_visible() {
                    self.warn_channel(message.channel_id, &error).await;
                }
                return Err(error);
            }
        };

        self.after_delivery(message, system, &settings, member, &username, delivery)
            .await;
        Ok(ProxyOutcome::Proxied(ProxyReceipt {
            relay_message_id: delivery.relay_message_id,
            member_id: member.id,
            matched_by,
            username,
            content,
        }))
    }

    fn validate(
        &self,
        username: &str,
        content: &str,
        message: &InboundMessage,
    ) -> Result<(), DomainError> {
        validate_display_name(
            username,
            self.config.display_name_min_chars,
            self.config.display_name_max_chars,
        )?;
        validate_content_length(content, MAX_RELAY_CONTENT_CHARS)?;
        let attachment_bytes = message.attachment_bytes();
        if attachment_bytes > self.config.max_attachment_bytes {
            return Err(DomainError::AttachmentsTooLarge {
                max: self.config.max_attachment_bytes,
                actual: attachment_bytes,
            });
        }
        Ok(())
    }

    async fn after_delivery(
        &self,
        message: &InboundMessage,
        system: &System,
        settings: &GuildProxySettings,
        member: &Member,
        username: &str,
        delivery: Delivery,
    ) {
        let mapping = MessageMapping {
            original_message_id: message.message_id,
            relay_message_id: delivery.relay_message_id,
            channel_id: message.channel_id,
            guild_id: message.guild_id,
            author_account_id: message.author_account_id,
            member_id: member.id,
        };
        let (saved, ()) = futures_util::join!(
            self.repo.save_message_mapping(&mapping),
            self.notify_log_channel(&mapping, member, username)
        );

        if member.allow_autoproxy {
            self.latch.record(
                system.id,
                settings.guild_id,
                member.id,
                system.latch_timeout(),
            );
        }

        // Without a mapping the original is the only record of the author.
        if let Err(error) = saved {
            self.metrics.record_origin_delete("kept");
            tracing::warn!(
                event = "proxy.mapping",
                outcome = "failed",
                relay_message_id = %delivery.relay_message_id,
                error = %error
            );
            return;
        }
        self.schedule_origin_delete(
            message.channel_id,
            message.message_id,
            delivery.relay_message_id,
        );
    }

    async fn notify_log_channel(&self, mapping: &MessageMapping, member: &Member, username: &str) {
        let log_channel = match self.repo.get_log_channel(mapping.guild_id).await {
            Ok(Some(channel)) if channel != mapping.channel_id => channel,
            Ok(_) => return,
            Err(error) => {
                tracing::warn!(event = "proxy.log_channel", outcome = "lookup_failed", error = %error);
                return;
            }
        };
        let notice = format!(
            "Message {} by {username} (member {}, account {}) proxied in channel {} as {}",
            mapping.original_message_id,
            member.id,
            mapping.author_account_id,
            mapping.channel_id,
            mapping.relay_message_id
        );
        if let Err(error) = self.transport.send_message(log_channel, &notice).await {
            tracing::warn!(
                event = "proxy.log_channel",
                outcome = "failed",
                log_channel_id = %log_channel,
                error = %error
            );
        }
    }

    /// Removes the original after the grace delay. If it is already gone the
    /// sender retracted it, so the relay copy goes too.
    fn schedule_origin_delete(
        &self,
        channel: ChannelId,
        original: MessageId,
        relay_message: MessageId,
    ) {
        let transport = self.transport.clone();
        let repo = self.repo.clone();
        let metrics = self.metrics.clone();
        let delay = self.config.origin_delete_delay;

        self.background.spawn(
            async move {
                tokio::time::sleep(delay).await;
                match transport.delete_message(channel, original).await {
                    Ok(()) => metrics.record_origin_delete("deleted"),
                    Err(error) if error.is_unknown_message() => {
                        metrics.record_origin_delete("already_gone");
                        if let Err(error) = transport.delete_message(channel, relay_message).await {
                            if !error.is_unknown_message() {
                                tracing::warn!(event = "proxy.retract", outcome = "failed", error = %error);
                            }
                        }
                        if let Err(error) = repo.delete_message_mapping(relay_message).await {
                            tracing::warn!(event = "proxy.retract", outcome = "mapping_failed", error = %error);
                        }
                    }
                    Err(error) => {
                        metrics.record_origin_delete("failed");
                        tracing::warn!(event = "proxy.origin_delete", outcome = "failed", error = %error);
                    }
                }
            }
            .in_current_span(),
        );
    }

    async fn warn_channel(&self, channel: ChannelId, error: &ProxyError) {
        if !self.warnings.try_claim(channel) {
            self.metrics.record_warning("throttled");
            return;
        }
        match self
            .transport
            .send_message(channel, &error.warning_text())
            .await
        {
            Ok(_) => self.metrics.record_warning("sent"),
            Err(send_error) => {
                self.metrics.record_warning("failed");
                tracing::warn!(event = "proxy.warning", outcome = "failed", error = %send_error);
            }
        }
    }
}
