use std::sync::Arc;

use plume_core::{AutoproxyMode, GuildProxySettings, InboundMessage, Member, MemberId, System};

use super::{
    latch::{LatchLookup, LatchTracker},
    member_cache::ProxyCandidates,
    repository::{Repository, RepositoryError},
};

const ESCAPE_PREFIX: char = '\\';

/// Why autoproxy picked nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoproxySkip {
    Off,
    AccountDisabled,
    ChannelBlacklisted,
    ProxyDisabled,
    Escaped,
    EmptyMessage,
    NoFronter,
    MemberMissing,
    MemberDisallowsAutoproxy,
    LatchEmpty,
    LatchExpired,
}

impl AutoproxySkip {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "autoproxy_off",
            Self::AccountDisabled => "autoproxy_account_disabled",
            Self::ChannelBlacklisted => "autoproxy_channel_blacklisted",
            Self::ProxyDisabled => "autoproxy_proxy_disabled",
            Self::Escaped => "autoproxy_escaped",
            Self::EmptyMessage => "autoproxy_empty_message",
            Self::NoFronter => "autoproxy_no_fronter",
            Self::MemberMissing => "autoproxy_member_missing",
            Self::MemberDisallowsAutoproxy => "autoproxy_member_disallows",
            Self::LatchEmpty => "autoproxy_latch_empty",
            Self::LatchExpired => "autoproxy_latch_expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoproxyDecision<'a> {
    Target(&'a Member),
    Skip(AutoproxySkip),
}

/// Inputs for one resolution; everything already loaded by the caller.
pub struct AutoproxyRequest<'a> {
    pub message: &'a InboundMessage,
    pub system: &'a System,
    pub candidates: &'a ProxyCandidates,
    pub settings: &'a GuildProxySettings,
    pub channel_blacklisted: bool,
}

/// Picks a member for an untagged message from the guild's autoproxy mode.
pub struct AutoproxyResolver {
    repo: Arc<dyn Repository>,
    latch: Arc<LatchTracker>,
}

impl AutoproxyResolver {
    pub(crate) fn new(repo: Arc<dyn Repository>, latch: Arc<LatchTracker>) -> Self {
        Self { repo, latch }
    }

    /// # Errors
    /// Returns [`RepositoryError`] when front mode cannot read the latest switch.
    pub async fn resolve<'a>(
        &self,
        request: &AutoproxyRequest<'a>,
    ) -> Result<AutoproxyDecision<'a>, RepositoryError> {
        if let Some(skip) = gate(request) {
            return Ok(AutoproxyDecision::Skip(skip));
        }

        let settings = request.settings;
        let target = match settings.autoproxy_mode {
            AutoproxyMode::Off => return Ok(AutoproxyDecision::Skip(AutoproxySkip::Off)),
            AutoproxyMode::Member => match settings.autoproxy_member {
                Some(id) => id,
                None => return Ok(AutoproxyDecision::Skip(AutoproxySkip::MemberMissing)),
            },
            AutoproxyMode::Front => {
                let fronters = self.repo.get_latest_switch(request.system.id).await?;
                match fronters.first() {
                    Some(id) => *id,
                    None => return Ok(AutoproxyDecision::Skip(AutoproxySkip::NoFronter)),
                }
            }
            AutoproxyMode::Latch => {
                match self.latch.lookup(
                    request.system.id,
                    settings.guild_id,
                    request.system.latch_timeout(),
                ) {
                    LatchLookup::Active(id) => id,
                    LatchLookup::Empty => {
                        return Ok(AutoproxyDecision::Skip(AutoproxySkip::LatchEmpty))
                    }
                    LatchLookup::Expired(_) => {
                        return Ok(AutoproxyDecision::Skip(AutoproxySkip::LatchExpired))
                    }
                }
            }
        };

        Ok(pick(request.candidates, target))
    }
}

fn gate(request: &AutoproxyRequest<'_>) -> Option<AutoproxySkip> {
    if !request.candidates.account_allows_autoproxy {
        return Some(AutoproxySkip::AccountDisabled);
    }
    if request.channel_blacklisted {
        return Some(AutoproxySkip::ChannelBlacklisted);
    }
    if !request.settings.proxy_enabled {
        return Some(AutoproxySkip::ProxyDisabled);
    }
    if request.message.is_blank() {
        return Some(AutoproxySkip::EmptyMessage);
    }
    if request.message.content.trim_start().starts_with(ESCAPE_PREFIX) {
        return Some(AutoproxySkip::Escaped);
    }
    None
}

fn pick(candidates: &ProxyCandidates, target: MemberId) -> AutoproxyDecision<'_> {
    match candidates.members.iter().find(|member| member.id == target) {
        None => AutoproxyDecision::Skip(AutoproxySkip::MemberMissing),
        Some(member) if !member.allow_autoproxy => {
            AutoproxyDecision::Skip(AutoproxySkip::MemberDisallowsAutoproxy)
        }
        Some(member) => AutoproxyDecision::Target(member),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use plume_core::{
        AccountId, AutoproxyMode, ChannelId, GuildId, GuildProxySettings, InboundMessage, Member,
        MemberId, MessageId, System, SystemId,
    };

    use super::{AutoproxyDecision, AutoproxyRequest, AutoproxyResolver, AutoproxySkip};
    use crate::server::{
        clock::ManualClock, latch::LatchTracker, member_cache::ProxyCandidates,
        repository::InMemoryRepository,
    };

    fn member(id: u64, allow_autoproxy: bool) -> Member {
        Member {
            id: MemberId::new(id),
            system_id: SystemId::new(1),
            name: format!("m{id}"),
            display_name: None,
            server_name: None,
            avatar_url: None,
            server_avatar_url: None,
            color: None,
            proxy_tags: Vec::new(),
            keep_proxy: false,
            allow_autoproxy,
        }
    }

    fn system(latch_timeout_secs: Option<u64>) -> System {
        System {
            id: SystemId::new(1),
            tag: None,
            avatar_url: None,
            case_sensitive_tags: false,
            latch_timeout_secs,
        }
    }

    fn candidates() -> ProxyCandidates {
        ProxyCandidates {
            system: Some(system(None)),
            account_allows_autoproxy: true,
            members: vec![member(1, true), member(2, false)],
        }
    }

    fn message(content: &str) -> InboundMessage {
        InboundMessage {
            message_id: MessageId::new(50),
            content: content.to_owned(),
            author_account_id: AccountId::new(9),
            author_is_bot: false,
            channel_id: ChannelId::new(7),
            guild_id: GuildId::new(3),
            attachments: Vec::new(),
            has_broad_mention_permission: false,
        }
    }

    fn settings(mode: AutoproxyMode, member: Option<u64>) -> GuildProxySettings {
        GuildProxySettings {
            autoproxy_mode: mode,
            autoproxy_member: member.map(MemberId::new),
            ..GuildProxySettings::unconfigured(GuildId::new(3), SystemId::new(1))
        }
    }

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
        latch: Arc<LatchTracker>,
        resolver: AutoproxyResolver,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(0));
        let latch = Arc::new(LatchTracker::new(clock.clone()));
        let resolver = AutoproxyResolver::new(repo.clone(), latch.clone());
        Fixture {
            repo,
            clock,
            latch,
            resolver,
        }
    }

    async fn decide(
        fixture: &Fixture,
        system: &System,
        candidates: &ProxyCandidates,
        settings: &GuildProxySettings,
        content: &str,
    ) -> Option<MemberId> {
        let message = message(content);
        let request = AutoproxyRequest {
            message: &message,
            system,
            candidates,
            settings,
            channel_blacklisted: false,
        };
        match fixture.resolver.resolve(&request).await.unwrap() {
            AutoproxyDecision::Target(member) => Some(member.id),
            AutoproxyDecision::Skip(_) => None,
        }
    }

    async fn skip_reason(
        fixture: &Fixture,
        candidates: &ProxyCandidates,
        settings: &GuildProxySettings,
        content: &str,
        channel_blacklisted: bool,
    ) -> AutoproxySkip {
        let message = message(content);
        let system = system(None);
        let request = AutoproxyRequest {
            message: &message,
            system: &system,
            candidates,
            settings,
            channel_blacklisted,
        };
        match fixture.resolver.resolve(&request).await.unwrap() {
            AutoproxyDecision::Skip(reason) => reason,
            AutoproxyDecision::Target(member) => panic!("unexpected target {}", member.id),
        }
    }

    #[tokio::test]
    async fn off_mode_picks_nobody() {
        let fixture = fixture();
        let reason = skip_reason(
            &fixture,
            &candidates(),
            &settings(AutoproxyMode::Off, None),
            "hi",
            false,
        )
        .await;
        assert_eq!(reason, AutoproxySkip::Off);
    }

    #[tokio::test]
    async fn member_mode_requires_member_opt_in() {
        let fixture = fixture();
        let system = system(None);
        assert_eq!(
            decide(
                &fixture,
                &system,
                &candidates(),
                &settings(AutoproxyMode::Member, Some(1)),
                "hi"
            )
            .await,
            Some(MemberId::new(1))
        );
        assert_eq!(
            skip_reason(
                &fixture,
                &candidates(),
                &settings(AutoproxyMode::Member, Some(2)),
                "hi",
                false
            )
            .await,
            AutoproxySkip::MemberDisallowsAutoproxy
        );
        assert_eq!(
            skip_reason(
                &fixture,
                &candidates(),
                &settings(AutoproxyMode::Member, Some(404)),
                "hi",
                false
            )
            .await,
            AutoproxySkip::MemberMissing
        );
    }

    #[tokio::test]
    async fn front_mode_uses_first_fronter() {
        let fixture = fixture();
        let front = settings(AutoproxyMode::Front, None);
        assert_eq!(
            skip_reason(&fixture, &candidates(), &front, "hi", false).await,
            AutoproxySkip::NoFronter
        );
        fixture
            .repo
            .record_switch(SystemId::new(1), vec![MemberId::new(1), MemberId::new(2)])
            .await;
        assert_eq!(
            decide(&fixture, &system(None), &candidates(), &front, "hi").await,
            Some(MemberId::new(1))
        );
    }

    #[tokio::test]
    async fn latch_mode_honours_timeout_boundary() {
        let fixture = fixture();
        let latch_settings = settings(AutoproxyMode::Latch, None);
        let system = system(Some(60));
        assert_eq!(
            skip_reason(&fixture, &candidates(), &latch_settings, "hi", false).await,
            AutoproxySkip::LatchEmpty
        );

        fixture.latch.record(
            SystemId::new(1),
            GuildId::new(3),
            MemberId::new(1),
            system.latch_timeout(),
        );
        fixture.clock.advance(Duration::from_secs(60));
        assert_eq!(
            decide(&fixture, &system, &candidates(), &latch_settings, "hi").await,
            Some(MemberId::new(1))
        );
        fixture.clock.advance(Duration::from_secs(1));
        assert_eq!(
            decide(&fixture, &system, &candidates(), &latch_settings, "hi").await,
            None
        );
    }

    #[tokio::test]
    async fn zero_latch_timeout_never_expires() {
        let fixture = fixture();
        let system = system(Some(0));
        fixture.latch.record(
            SystemId::new(1),
            GuildId::new(3),
            MemberId::new(1),
            system.latch_timeout(),
        );
        fixture.clock.advance(Duration::from_secs(30 * 24 * 3600));
        assert_eq!(
            decide(
                &fixture,
                &system,
                &candidates(),
                &settings(AutoproxyMode::Latch, None),
                "hi"
            )
            .await,
            Some(MemberId::new(1))
        );
    }

    #[tokio::test]
    async fn gates_run_before_mode() {
        let fixture = fixture();
        let member_mode = settings(AutoproxyMode::Member, Some(1));
        assert_eq!(
            skip_reason(&fixture, &candidates(), &member_mode, "hi", true).await,
            AutoproxySkip::ChannelBlacklisted
        );
        assert_eq!(
            skip_reason(&fixture, &candidates(), &member_mode, "\\not me", false).await,
            AutoproxySkip::Escaped
        );
        assert_eq!(
            skip_reason(&fixture, &candidates(), &member_mode, "   ", false).await,
            AutoproxySkip::EmptyMessage
        );

        let disabled = GuildProxySettings {
            proxy_enabled: false,
            ..member_mode.clone()
        };
        assert_eq!(
            skip_reason(&fixture, &candidates(), &disabled, "hi", false).await,
            AutoproxySkip::ProxyDisabled
        );

        let opted_out = ProxyCandidates {
            account_allows_autoproxy: false,
            ..candidates()
        };
        assert_eq!(
            skip_reason(&fixture, &opted_out, &member_mode, "hi", false).await,
            AutoproxySkip::AccountDisabled
        );
    }
}
