use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use plume_core::{AccountId, Attachment, ChannelId, GuildId, InboundMessage, MessageId};
use plume_protocol::MessageCreateEvent;
use serde::Serialize;

use super::{core::AppState, metrics::METRICS_TEXT_CONTENT_TYPE};

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    pub(crate) error: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        state.pipeline.metrics().render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct EventAccepted {
    pub(crate) accepted: bool,
    pub(crate) message_id: String,
}

pub(crate) fn inbound_from_event(event: MessageCreateEvent) -> InboundMessage {
    InboundMessage {
        message_id: MessageId::new(event.message_id.get()),
        content: event.content,
        author_account_id: AccountId::new(event.author_account_id.get()),
        author_is_bot: event.author_is_bot,
        channel_id: ChannelId::new(event.channel_id.get()),
        guild_id: GuildId::new(event.guild_id.get()),
        attachments: event
            .attachments
            .into_iter()
            .map(|attachment| Attachment {
                url: attachment.url,
                filename: attachment.filename,
                size_bytes: attachment.size_bytes,
            })
            .collect(),
        has_broad_mention_permission: event.has_broad_mention_permission,
    }
}
