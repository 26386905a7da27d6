use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, StatusCode},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    handlers::{
        invalidate_account, invalidate_guild_settings, invalidate_system, receive_message_event,
    },
    pipeline::ProxyPipeline,
    types::{health, metrics},
};

/// Build the ingress router with a pipeline wired from `config`.
///
/// # Errors
/// Returns an error if config is invalid or the pipeline cannot be built.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    let pipeline = ProxyPipeline::from_config(config)?;
    build_router_with_pipeline(config, Arc::new(pipeline))
}

/// Build the ingress router around an existing pipeline.
///
/// # Errors
/// Returns an error if config is invalid.
pub fn build_router_with_pipeline(
    config: &AppConfig,
    pipeline: Arc<ProxyPipeline>,
) -> anyhow::Result<Router> {
    if config.max_body_bytes > plume_protocol::MAX_EVENT_BYTES {
        return Err(anyhow!(
            "body limit cannot exceed protocol max of {} bytes",
            plume_protocol::MAX_EVENT_BYTES
        ));
    }
    if config.lane_capacity == 0 {
        return Err(anyhow!("lane capacity must be at least 1"));
    }
    if config.display_name_min_chars > config.display_name_max_chars {
        return Err(anyhow!(
            "display name bounds are inverted: min={} max={}",
            config.display_name_min_chars,
            config.display_name_max_chars
        ));
    }

    let request_id_header = HeaderName::from_static("x-request-id");
    let state = AppState::new(pipeline);

    Ok(Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/events/message", post(receive_message_event))
        .route(
            "/v1/invalidate/accounts/{account_id}",
            post(invalidate_account),
        )
        .route("/v1/invalidate/systems/{system_id}", post(invalidate_system))
        .route(
            "/v1/invalidate/guilds/{guild_id}/systems/{system_id}",
            post(invalidate_guild_settings),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                )),
        ))
}
