// src/routes/mod.rs

use crate::{
    handlers::{
        attendance::get_attendance, events::ingest_event, reimbursement::list_reimbursements,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // ─── Event ingestion ──────────────────────────────────
        .route("/events", post(ingest_event))
        // ─── Derived ledgers ──────────────────────────────────
        .route("/attendance/{office_id}/{phone}", get(get_attendance))
        .route("/reimbursements/{office_id}", get(list_reimbursements))
}
