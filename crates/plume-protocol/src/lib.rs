#![forbid(unsafe_code)]

mod events;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use events::{parse_message_event, EventAttachment, MessageCreateEvent, MAX_EVENT_BYTES};

/// Upstream error code for a relay endpoint that no longer exists.
pub const UNKNOWN_WEBHOOK: u32 = 10015;
/// Upstream error code for a message that no longer exists.
pub const UNKNOWN_MESSAGE: u32 = 10008;
pub const MISSING_PERMISSIONS: u32 = 50013;
/// Most relay endpoints a single channel may hold.
pub const MAX_RELAYS_PER_CHANNEL: usize = 15;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";

/// Platform identifier; sent as a decimal string, accepted as string or number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SnowflakeRepr", into = "String")]
pub struct Snowflake(u64);

impl Snowflake {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnowflakeRepr {
    Text(String),
    Number(u64),
}

impl TryFrom<SnowflakeRepr> for Snowflake {
    type Error = ProtocolError;

    fn try_from(value: SnowflakeRepr) -> Result<Self, Self::Error> {
        match value {
            SnowflakeRepr::Number(value) => Ok(Self(value)),
            SnowflakeRepr::Text(value) => value
                .parse::<u64>()
                .map(Self)
                .map_err(|_| ProtocolError::InvalidSnowflake),
        }
    }
}

impl From<Snowflake> for String {
    fn from(value: Snowflake) -> Self {
        value.0.to_string()
    }
}

impl core::fmt::Display for Snowflake {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A relay endpoint as listed or created by the upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayWebhook {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub name: Option<String>,
    /// Only present for endpoints owned by the caller.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub application_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRelay {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionKind {
    Users,
    Roles,
    Everyone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedMentions {
    pub parse: Vec<MentionKind>,
}

impl AllowedMentions {
    #[must_use]
    pub fn for_sender(allow_broad_mentions: bool) -> Self {
        let mut parse = vec![MentionKind::Users, MentionKind::Roles];
        if allow_broad_mentions {
            parse.push(MentionKind::Everyone);
        }
        Self { parse }
    }

    #[must_use]
    pub fn none() -> Self {
        Self { parse: Vec::new() }
    }
}

/// Body of a relay execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRelay {
    pub content: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub allowed_mentions: AllowedMentions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessage {
    pub content: String,
    pub allowed_mentions: AllowedMentions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: Snowflake,
    pub channel_id: Snowflake,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

/// Parse an upstream error body, tolerating empty or foreign payloads.
#[must_use]
pub fn parse_api_error(body: &[u8]) -> Option<ApiErrorBody> {
    serde_json::from_slice(body).ok()
}

/// Rate-limit headers reported with every relay response.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Read the headers through `lookup`, which receives lowercase names.
    /// Unparseable values are treated as absent.
    pub fn from_lookup<'a>(lookup: impl Fn(&str) -> Option<&'a str>) -> Self {
        let integer = |name: &str| lookup(name).and_then(|value| value.trim().parse::<i64>().ok());
        let reset_after = lookup(RATE_LIMIT_RESET_AFTER_HEADER)
            .and_then(|value| value.trim().parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        Self {
            limit: integer(RATE_LIMIT_LIMIT_HEADER).filter(|value| *value >= 0),
            remaining: integer(RATE_LIMIT_REMAINING_HEADER).filter(|value| *value >= 0),
            reset_after,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset_after.is_none()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload exceeds max size: max={max} bytes actual={actual} bytes")]
    OversizedPayload { max: usize, actual: usize },
    #[error("invalid json payload")]
    InvalidJson,
    #[error("invalid snowflake")]
    InvalidSnowflake,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}
