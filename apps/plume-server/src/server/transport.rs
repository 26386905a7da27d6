use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use plume_core::{Attachment, ChannelId, MessageId, RelayId};
use plume_protocol::{
    parse_api_error, AllowedMentions, ApiErrorBody, CreateMessage, CreateRelay, ExecuteRelay,
    RateLimitHeaders, RelayMessage, RelayWebhook, UNKNOWN_MESSAGE,
};
use reqwest::{
    multipart::{Form, Part},
    Body, Client, Response, StatusCode,
};

const NOT_FOUND: u16 = 404;

/// Credentials for executing one relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHandle {
    pub id: RelayId,
    pub token: String,
    pub channel_id: ChannelId,
}

/// A message ready to be posted through a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayExecution {
    pub username: String,
    pub avatar_url: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub allowed_mentions: AllowedMentions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayResponseBody {
    Delivered(RelayMessage),
    /// 2xx whose body did not decode. The message may have been posted.
    Unreadable,
    Rejected(Option<ApiErrorBody>),
}

/// Raw outcome of a relay execution. Non-2xx responses are returned, not raised,
/// so the caller always sees the rate-limit headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayExchange {
    pub status: u16,
    pub rate_limit: RateLimitHeaders,
    pub body: RelayResponseBody,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("relay api unreachable: {0}")]
    Network(String),
    #[error("relay api returned status {status}")]
    Status {
        status: u16,
        code: Option<u32>,
        message: Option<String>,
    },
    #[error("relay api response could not be decoded")]
    Decode,
    #[error("attachment {0} could not be fetched")]
    Attachment(String),
}

impl TransportError {
    #[must_use]
    pub fn api_code(&self) -> Option<u32> {
        match self {
            Self::Status { code, .. } => *code,
            _ => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The target message no longer exists.
    #[must_use]
    pub fn is_unknown_message(&self) -> bool {
        self.api_code() == Some(UNKNOWN_MESSAGE)
            || (self.status() == Some(NOT_FOUND) && self.api_code().is_none())
    }
}

/// Upstream chat API used to post, list and delete relay messages.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn list_relays(&self, channel: ChannelId) -> Result<Vec<RelayWebhook>, TransportError>;

    async fn create_relay(
        &self,
        channel: ChannelId,
        name: &str,
    ) -> Result<RelayWebhook, TransportError>;

    async fn execute_relay(
        &self,
        relay: &RelayHandle,
        execution: &RelayExecution,
    ) -> Result<RelayExchange, TransportError>;

    async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), TransportError>;

    /// Post a plain bot message, used for warnings and log notifications.
    async fn send_message(
        &self,
        channel: ChannelId,
        content: &str,
    ) -> Result<MessageId, TransportError>;
}

pub struct HttpRelayTransport {
    client: Client,
    base_url: String,
    authorization: String,
}

impl HttpRelayTransport {
    /// # Errors
    /// Returns [`TransportError::Network`] when the HTTP client cannot be built.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| TransportError::Network(error.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            authorization: format!("Bot {token}"),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn multipart_form(&self, execution: &RelayExecution) -> Result<Form, TransportError> {
        let payload = serde_json::to_string(&execute_payload(execution))
            .map_err(|_| TransportError::Decode)?;
        let mut form = Form::new().text("payload_json", payload);
        for (index, attachment) in execution.attachments.iter().enumerate() {
            let source = self
                .client
                .get(&attachment.url)
                .send()
                .await
                .and_then(Response::error_for_status)
                .map_err(|_| TransportError::Attachment(attachment.filename.clone()))?;
            let part = match source.content_length() {
                Some(length) => {
                    Part::stream_with_length(Body::wrap_stream(source.bytes_stream()), length)
                }
                None => Part::stream(Body::wrap_stream(source.bytes_stream())),
            };
            form = form.part(
                format!("files[{index}]"),
                part.file_name(attachment.filename.clone()),
            );
        }
        Ok(form)
    }
}

fn execute_payload(execution: &RelayExecution) -> ExecuteRelay {
    ExecuteRelay {
        content: execution.content.clone(),
        username: execution.username.clone(),
        avatar_url: execution.avatar_url.clone(),
        allowed_mentions: execution.allowed_mentions.clone(),
    }
}

fn network(error: &reqwest::Error) -> TransportError {
    TransportError::Network(error.to_string())
}

/// Read the body of a response that must be 2xx.
async fn success_body(response: Response) -> Result<Bytes, TransportError> {
    let status = response.status();
    let body = response.bytes().await.map_err(|error| network(&error))?;
    if status.is_success() {
        return Ok(body);
    }
    let api_error = parse_api_error(&body);
    Err(TransportError::Status {
        status: status.as_u16(),
        code: api_error.as_ref().map(|error| error.code),
        message: api_error.map(|error| error.message),
    })
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(body).map_err(|_| TransportError::Decode)
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn list_relays(&self, channel: ChannelId) -> Result<Vec<RelayWebhook>, TransportError> {
        let response = self
            .client
            .get(self.url(&format!("/channels/{channel}/relays")))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .send()
            .await
            .map_err(|error| network(&error))?;
        decode(&success_body(response).await?)
    }

    async fn create_relay(
        &self,
        channel: ChannelId,
        name: &str,
    ) -> Result<RelayWebhook, TransportError> {
        let response = self
            .client
            .post(self.url(&format!("/channels/{channel}/relays")))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(&CreateRelay {
                name: name.to_owned(),
            })
            .send()
            .await
            .map_err(|error| network(&error))?;
        decode(&success_body(response).await?)
    }

    async fn execute_relay(
        &self,
        relay: &RelayHandle,
        execution: &RelayExecution,
    ) -> Result<RelayExchange, TransportError> {
        let request = self.client.post(self.url(&format!(
            "/relay/{}/{}?wait=true",
            relay.id, relay.token
        )));
        let request = if execution.attachments.is_empty() {
            request.json(&execute_payload(execution))
        } else {
            request.multipart(self.multipart_form(execution).await?)
        };
        let response = request.send().await.map_err(|error| network(&error))?;

        let status = response.status();
        let headers = response.headers();
        let rate_limit = RateLimitHeaders::from_lookup(|name| {
            headers.get(name).and_then(|value| value.to_str().ok())
        });
        let body = response.bytes().await.map_err(|error| network(&error))?;

        let body = if status.is_success() {
            decode(&body).map_or(RelayResponseBody::Unreadable, RelayResponseBody::Delivered)
        } else {
            RelayResponseBody::Rejected(parse_api_error(&body))
        };
        Ok(RelayExchange {
            status: status.as_u16(),
            rate_limit,
            body,
        })
    }

    async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .delete(self.url(&format!("/channels/{channel}/messages/{message}")))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .send()
            .await
            .map_err(|error| network(&error))?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        success_body(response).await.map(|_| ())
    }

    async fn send_message(
        &self,
        channel: ChannelId,
        content: &str,
    ) -> Result<MessageId, TransportError> {
        let response = self
            .client
            .post(self.url(&format!("/channels/{channel}/messages")))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(&CreateMessage {
                content: content.to_owned(),
                allowed_mentions: AllowedMentions::none(),
            })
            .send()
            .await
            .map_err(|error| network(&error))?;
        let message: RelayMessage = decode(&success_body(response).await?)?;
        Ok(MessageId::new(message.id.get()))
    }
}
