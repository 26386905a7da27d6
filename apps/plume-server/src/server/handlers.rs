use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use plume_core::{AccountId, GuildId, SystemId};
use plume_protocol::{parse_message_event, ProtocolError};

use super::{
    core::AppState,
    errors::ApiFailure,
    types::{inbound_from_event, EventAccepted},
};

pub(crate) async fn receive_message_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<EventAccepted>), ApiFailure> {
    let event = parse_message_event(&body).map_err(|error| match error {
        ProtocolError::OversizedPayload { .. } => ApiFailure::PayloadTooLarge,
        ProtocolError::InvalidJson | ProtocolError::InvalidSnowflake => {
            ApiFailure::InvalidRequest
        }
    })?;
    let message = inbound_from_event(event);
    let message_id = message.message_id.to_string();

    state.pipeline.submit(message).map_err(|_| ApiFailure::LaneFull)?;
    tracing::debug!(event = "ingress.message", outcome = "queued", message_id = %message_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(EventAccepted {
            accepted: true,
            message_id,
        }),
    ))
}

pub(crate) async fn invalidate_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let account = AccountId::try_from(account_id).map_err(|_| ApiFailure::InvalidRequest)?;
    state.pipeline.invalidate_account(account);
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn invalidate_system(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let system = SystemId::try_from(system_id).map_err(|_| ApiFailure::InvalidRequest)?;
    state.pipeline.invalidate_system(system);
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn invalidate_guild_settings(
    State(state): State<AppState>,
    Path((guild_id, system_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiFailure> {
    let guild = GuildId::try_from(guild_id).map_err(|_| ApiFailure::InvalidRequest)?;
    let system = SystemId::try_from(system_id).map_err(|_| ApiFailure::InvalidRequest)?;
    state.pipeline.invalidate_guild_settings(guild, system);
    Ok(StatusCode::NO_CONTENT)
}
