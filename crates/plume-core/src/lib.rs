#![forbid(unsafe_code)]

mod content;
mod tags;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use content::{
    compose_display_name, neutralize_broad_mentions, relay_username, resolve_avatar_url,
    truncate_chars, validate_content_length, validate_display_name, MAX_RELAY_CONTENT_CHARS,
    MAX_RELAY_USERNAME_CHARS,
};
pub use tags::{match_proxy_tags, TagMatch};

/// Latch expiry applied when a system has not configured one.
pub const DEFAULT_LATCH_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "plume"
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("identifier is invalid")]
    InvalidId,
    #[error("proxy tag needs a prefix or a suffix")]
    EmptyProxyTag,
    #[error("autoproxy mode {0} is unknown")]
    InvalidAutoproxyMode(i16),
    #[error("display name is too short: min={min} chars actual={actual} chars")]
    DisplayNameTooShort { min: usize, actual: usize },
    #[error("display name is too long: max={max} chars actual={actual} chars")]
    DisplayNameTooLong { max: usize, actual: usize },
    #[error("message is too long: max={max} chars actual={actual} chars")]
    ContentTooLong { max: usize, actual: usize },
    #[error("attachments are too large: max={max} bytes actual={actual} bytes")]
    AttachmentsTooLarge { max: u64, actual: u64 },
}

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value
                    .parse::<u64>()
                    .map(Self)
                    .map_err(|_| DomainError::InvalidId)
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

snowflake_id!(
    /// Chat-platform user account.
    AccountId
);
snowflake_id!(GuildId);
snowflake_id!(ChannelId);
snowflake_id!(MessageId);
snowflake_id!(SystemId);
snowflake_id!(MemberId);
snowflake_id!(
    /// Relay endpoint (webhook) identifier.
    RelayId
);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyTag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl ProxyTag {
    /// Builds a tag, rejecting one with neither a prefix nor a suffix.
    ///
    /// # Errors
    /// Returns [`DomainError::EmptyProxyTag`] when both sides are empty.
    pub fn new(prefix: Option<String>, suffix: Option<String>) -> Result<Self, DomainError> {
        let tag = Self {
            prefix: prefix.filter(|value| !value.is_empty()),
            suffix: suffix.filter(|value| !value.is_empty()),
        };
        if tag.is_empty() {
            return Err(DomainError::EmptyProxyTag);
        }
        Ok(tag)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn suffix(&self) -> &str {
        self.suffix.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefix().is_empty() && self.suffix().is_empty()
    }

    /// Human-readable form, e.g. `[text]`.
    #[must_use]
    pub fn proxy_string(&self) -> String {
        format!("{}text{}", self.prefix(), self.suffix())
    }

    /// Specificity used to rank competing tags.
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.prefix().chars().count() + self.suffix().chars().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub system_id: SystemId,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Per-guild name override.
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Per-guild avatar override.
    #[serde(default)]
    pub server_avatar_url: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub proxy_tags: Vec<ProxyTag>,
    #[serde(default)]
    pub keep_proxy: bool,
    #[serde(default = "default_true")]
    pub allow_autoproxy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    pub id: SystemId,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub case_sensitive_tags: bool,
    /// `None` uses the default; `Some(0)` keeps latches forever.
    #[serde(default)]
    pub latch_timeout_secs: Option<u64>,
}

impl System {
    /// Effective latch expiry, `None` when latches never expire.
    #[must_use]
    pub fn latch_timeout(&self) -> Option<Duration> {
        match self.latch_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(DEFAULT_LATCH_TIMEOUT_SECS)),
        }
    }
}

/// Account link to a system, with the account-level autoproxy switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAccount {
    pub account_id: AccountId,
    pub system: System,
    pub allow_autoproxy: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AutoproxyMode {
    #[default]
    Off = 1,
    Front = 2,
    Latch = 3,
    Member = 4,
}

impl AutoproxyMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Front => "front",
            Self::Latch => "latch",
            Self::Member => "member",
        }
    }

    #[must_use]
    pub const fn as_i16(self) -> i16 {
        self as i16
    }
}

impl TryFrom<i16> for AutoproxyMode {
    type Error = DomainError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Off),
            2 => Ok(Self::Front),
            3 => Ok(Self::Latch),
            4 => Ok(Self::Member),
            other => Err(DomainError::InvalidAutoproxyMode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildProxySettings {
    pub guild_id: GuildId,
    pub system_id: SystemId,
    pub proxy_enabled: bool,
    pub autoproxy_mode: AutoproxyMode,
    #[serde(default)]
    pub autoproxy_member: Option<MemberId>,
    /// Per-guild system tag override.
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default = "default_true")]
    pub tag_enabled: bool,
}

impl GuildProxySettings {
    /// Settings used when a system never configured the guild.
    #[must_use]
    pub fn unconfigured(guild_id: GuildId, system_id: SystemId) -> Self {
        Self {
            guild_id,
            system_id,
            proxy_enabled: true,
            autoproxy_mode: AutoproxyMode::Off,
            autoproxy_member: None,
            tag: None,
            tag_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatchState {
    pub system_id: SystemId,
    pub guild_id: GuildId,
    pub last_proxied_member: MemberId,
    pub last_proxied_at_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMapping {
    pub original_message_id: MessageId,
    pub relay_message_id: MessageId,
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
    pub author_account_id: AccountId,
    pub member_id: MemberId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// A chat message as seen by the proxy pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub content: String,
    pub author_account_id: AccountId,
    #[serde(default)]
    pub author_is_bot: bool,
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub has_broad_mention_permission: bool,
}

impl InboundMessage {
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// True when there is nothing to relay.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty() && !self.has_attachments()
    }

    #[must_use]
    pub fn attachment_bytes(&self) -> u64 {
        self.attachments
            .iter()
            .map(|attachment| attachment.size_bytes)
            .sum()
    }
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        project_name, AutoproxyMode, ChannelId, DomainError, GuildId, GuildProxySettings,
        InboundMessage, MemberId, ProxyTag, System, SystemId, DEFAULT_LATCH_TIMEOUT_SECS,
    };

    #[test]
    fn project_name_is_stable() {
        assert_eq!(project_name(), "plume");
    }

    #[test]
    fn ids_parse_from_decimal_strings() {
        let id = ChannelId::try_from(String::from("466378653216014359")).unwrap();
        assert_eq!(id.get(), 466_378_653_216_014_359);
        assert_eq!(id.to_string(), "466378653216014359");
        assert_eq!(
            MemberId::try_from(String::from("abc")).unwrap_err(),
            DomainError::InvalidId
        );
    }

    #[test]
    fn ids_serialize_transparently() {
        let encoded = serde_json::to_string(&GuildId::new(42)).unwrap();
        assert_eq!(encoded, "42");
    }

    #[test]
    fn proxy_tag_requires_one_side() {
        assert_eq!(
            ProxyTag::new(Some(String::new()), None).unwrap_err(),
            DomainError::EmptyProxyTag
        );
        let tag = ProxyTag::new(Some(String::from("[")), Some(String::from("]"))).unwrap();
        assert_eq!(tag.proxy_string(), "[text]");
        assert_eq!(tag.specificity(), 2);
    }

    #[test]
    fn latch_timeout_defaults_and_zero_disables() {
        let mut system = System {
            id: SystemId::new(1),
            tag: None,
            avatar_url: None,
            case_sensitive_tags: false,
            latch_timeout_secs: None,
        };
        assert_eq!(
            system.latch_timeout(),
            Some(Duration::from_secs(DEFAULT_LATCH_TIMEOUT_SECS))
        );
        system.latch_timeout_secs = Some(0);
        assert_eq!(system.latch_timeout(), None);
        system.latch_timeout_secs = Some(90);
        assert_eq!(system.latch_timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn autoproxy_mode_round_trips_storage_codes() {
        for mode in [
            AutoproxyMode::Off,
            AutoproxyMode::Front,
            AutoproxyMode::Latch,
            AutoproxyMode::Member,
        ] {
            assert_eq!(AutoproxyMode::try_from(mode.as_i16()).unwrap(), mode);
        }
        assert_eq!(
            AutoproxyMode::try_from(9).unwrap_err(),
            DomainError::InvalidAutoproxyMode(9)
        );
    }

    #[test]
    fn unconfigured_guild_settings_allow_proxying() {
        let settings = GuildProxySettings::unconfigured(GuildId::new(1), SystemId::new(2));
        assert!(settings.proxy_enabled);
        assert!(settings.tag_enabled);
        assert_eq!(settings.autoproxy_mode, AutoproxyMode::Off);
    }

    #[test]
    fn inbound_message_defaults_optional_fields() {
        let message: InboundMessage = serde_json::from_str(
            r#"{"message_id":1,"content":"  ","author_account_id":2,"channel_id":3,"guild_id":4}"#,
        )
        .unwrap();
        assert!(message.is_blank());
        assert!(!message.author_is_bot);
        assert_eq!(message.attachment_bytes(), 0);
    }
}
