// src/handlers/general.rs

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;

/// Root handler: service banner with pointers to the docs
pub async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "attendance-system",
        "description": "Event-to-ledger aggregation engine for attendance and travel reimbursement",
        "docs": "/docs",
        "health": "/health",
    }))
}

/// Liveness check: verifies the database answers
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": e.to_string() })),
        ),
    }
}
