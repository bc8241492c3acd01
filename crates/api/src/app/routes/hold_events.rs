//! HTTP ingress for hold events, alongside the Redis consumer.

use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use creditx_events::InboundMessage;

use crate::app::errors;
use crate::app::services::AppServices;

pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Process one hold event. The tag comes from `X-Event-Type`, falling back to
/// an `eventType` field in the body.
pub async fn ingest_hold_event(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    let tag = match headers.get(EVENT_TYPE_HEADER).map(|v| v.to_str()) {
        None => None,
        Some(Ok(v)) => Some(v.trim().to_string()),
        Some(Err(_)) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "X-Event-Type must be visible ASCII",
            );
        }
    };

    let message = InboundMessage::new(tag, body);
    match services.processor().handle_message(&message).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
