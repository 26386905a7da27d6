use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Snowflake};

/// Maximum accepted inbound event bytes.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventAttachment {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// A message-create event delivered by the gateway layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageCreateEvent {
    pub message_id: Snowflake,
    pub content: String,
    pub author_account_id: Snowflake,
    #[serde(default)]
    pub author_is_bot: bool,
    pub channel_id: Snowflake,
    pub guild_id: Snowflake,
    #[serde(default)]
    pub attachments: Vec<EventAttachment>,
    #[serde(default)]
    pub has_broad_mention_permission: bool,
}

/// Parse and validate an inbound message event at the network boundary.
///
/// # Errors
/// Returns [`ProtocolError`] if the payload exceeds [`MAX_EVENT_BYTES`], is
/// malformed JSON, or carries fields this protocol does not know.
pub fn parse_message_event(input: &[u8]) -> Result<MessageCreateEvent, ProtocolError> {
    if input.len() > MAX_EVENT_BYTES {
        return Err(ProtocolError::OversizedPayload {
            max: MAX_EVENT_BYTES,
            actual: input.len(),
        });
    }
    Ok(serde_json::from_slice(input)?)
}

#[cfg(test)]
mod tests {
    use super::{parse_message_event, MAX_EVENT_BYTES};
    use crate::ProtocolError;

    #[test]
    fn parses_minimal_event() {
        let event = parse_message_event(
            br#"{"message_id":"10","content":"[hi]","author_account_id":"11","channel_id":"12","guild_id":"13"}"#,
        )
        .unwrap();
        assert_eq!(event.message_id.get(), 10);
        assert!(event.attachments.is_empty());
        assert!(!event.has_broad_mention_permission);
    }

    #[test]
    fn rejects_unknown_fields() {
        let error = parse_message_event(
            br#"{"message_id":"10","content":"","author_account_id":"11","channel_id":"12","guild_id":"13","extra":1}"#,
        )
        .unwrap_err();
        assert_eq!(error, ProtocolError::InvalidJson);
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = vec![b' '; MAX_EVENT_BYTES + 1];
        assert_eq!(
            parse_message_event(&payload).unwrap_err(),
            ProtocolError::OversizedPayload {
                max: MAX_EVENT_BYTES,
                actual: MAX_EVENT_BYTES + 1,
            }
        );
    }
}
