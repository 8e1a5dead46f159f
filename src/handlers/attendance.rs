// src/handlers/attendance.rs

use crate::{
    errors::{AppError, AppResult},
    models::AttendanceRecord,
    services::attendance,
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
pub struct MonthQuery {
    /// Calendar month, 1-12
    pub month: u32,
    pub year: i32,
}

/// Read one employee's monthly attendance record
#[utoipa::path(
    get,
    path = "/api/v1/attendance/{office_id}/{phone}",
    params(
        ("office_id" = Uuid, Path, description = "Office id"),
        ("phone" = String, Path, description = "Employee phone number"),
        MonthQuery,
    ),
    responses(
        (status = 200, description = "Monthly attendance record", body = AttendanceRecord),
        (status = 404, description = "No record for that employee/month"),
    ),
    tag = "Attendance"
)]
pub async fn get_attendance(
    State(state): State<AppState>,
    Path((office_id, phone)): Path<(Uuid, String)>,
    Query(query): Query<MonthQuery>,
) -> AppResult<Json<AttendanceRecord>> {
    if !(1..=12).contains(&query.month) {
        return Err(AppError::Validation("month must be between 1 and 12".to_string()));
    }

    let record = attendance::load_record(&state.db, office_id, &phone, query.month, query.year)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no attendance record for {phone} in {}/{}",
                query.month, query.year
            ))
        })?;

    Ok(Json(record))
}
