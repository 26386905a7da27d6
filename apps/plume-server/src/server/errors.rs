use axum::{http::StatusCode, response::IntoResponse, Json};

use super::types::ApiError;

#[derive(Debug)]
pub(crate) enum ApiFailure {
    InvalidRequest,
    PayloadTooLarge,
    LaneFull,
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::InvalidRequest => (
                StatusCode::BAD_REQUEST,
                Json(ApiError {
                    error: "invalid_request",
                }),
            )
                .into_response(),
            Self::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ApiError {
                    error: "payload_too_large",
                }),
            )
                .into_response(),
            Self::LaneFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiError {
                    error: "lane_full",
                }),
            )
                .into_response(),
        }
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
