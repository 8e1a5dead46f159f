// src/handlers/reimbursement.rs

use crate::{
    errors::AppResult,
    models::ReimbursementEntry,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ReimbursementQuery {
    /// Restrict to one employee
    pub phone: Option<String>,
    pub month: Option<i32>,
    pub year: Option<i32>,
    /// Include open (intermediate) legs; finalized-only by default
    #[serde(default)]
    pub include_open: bool,
}

/// List reimbursement ledger entries for an office
#[utoipa::path(
    get,
    path = "/api/v1/reimbursements/{office_id}",
    params(
        ("office_id" = Uuid, Path, description = "Office id"),
        ReimbursementQuery,
    ),
    responses(
        (status = 200, description = "Ledger entries", body = Vec<ReimbursementEntry>),
    ),
    tag = "Reimbursements"
)]
pub async fn list_reimbursements(
    State(state): State<AppState>,
    Path(office_id): Path<Uuid>,
    Query(query): Query<ReimbursementQuery>,
) -> AppResult<Json<Vec<ReimbursementEntry>>> {
    let entries = sqlx::query_as::<_, ReimbursementEntry>(
        r#"SELECT id, office_id, entry_type, name, day, month, year, employee_phone,
                  activity_id, amount, intermediate, previous_lat, previous_lng,
                  current_lat, current_lng, previous_identifier, current_identifier,
                  distance_km, created_at, updated_at
           FROM reimbursement_entries
           WHERE office_id = $1
             AND ($2::text IS NULL OR employee_phone = $2)
             AND ($3::int IS NULL OR month = $3)
             AND ($4::int IS NULL OR year = $4)
             AND ($5::bool OR intermediate = FALSE)
           ORDER BY year, month, day, created_at"#,
    )
    .bind(office_id)
    .bind(&query.phone)
    .bind(query.month)
    .bind(query.year)
    .bind(query.include_open)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(entries))
}
