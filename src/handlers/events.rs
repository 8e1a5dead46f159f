// src/handlers/events.rs

use crate::{
    errors::{AppError, AppResult},
    models::{EventEnvelope, IngestResponse},
    services::pipeline,
    state::AppState,
};
use axum::{Json, extract::State, http::StatusCode};
use tracing::debug;

/// Ingest one activity lifecycle event.
///
/// Delivery is at-least-once with no ordering guarantee; redelivering the
/// same `event_id` is harmless. The aggregation pass runs in the background
/// so the event source is never blocked on ledger writes.
#[utoipa::path(
    post,
    path = "/api/v1/events",
    request_body = EventEnvelope,
    responses(
        (status = 202, description = "Event accepted for aggregation", body = IngestResponse),
        (status = 400, description = "Malformed envelope"),
    ),
    tag = "Events"
)]
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(envelope): Json<EventEnvelope>,
) -> AppResult<(StatusCode, Json<IngestResponse>)> {
    if envelope.user_phone.trim().is_empty() {
        return Err(AppError::Validation("user_phone must not be empty".to_string()));
    }

    let response = IngestResponse {
        addendum_id: envelope.event_id,
        aggregated: pipeline::will_aggregate(&envelope),
    };

    debug!(
        event_id = %envelope.event_id,
        office_id = %envelope.office_id,
        action = ?envelope.action,
        "event accepted"
    );
    tokio::spawn(pipeline::run_pass(state.clone(), envelope));

    Ok((StatusCode::ACCEPTED, Json(response)))
}
