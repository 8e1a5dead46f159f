// src/services/backfill.rs
//
// Backfill: when an employee's first event of a new month creates the
// monthly record, the previous month's record is completed retroactively
// from weekly-off, branch-holiday and leave data.

use crate::errors::AppResult;
use crate::models::{
    AddendumEvent, AttendanceRecord, DayMap, LeaveRecord, RoleSnapshot, VenueRecord,
};
use crate::services::attendance;
use crate::services::batch::{BatchWriter, WriteOp};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// The gap exists when the last known check-in (or, failing that, the role
/// itself) belongs to a different month than today.
pub fn needs_backfill(today: NaiveDate, role: &RoleSnapshot, tz: Tz) -> bool {
    let anchor = role
        .last_check_in_at
        .unwrap_or(role.created_at)
        .with_timezone(&tz)
        .date_naive();
    (anchor.year(), anchor.month()) != (today.year(), today.month())
}

/// Previous-month fill range: starts at the latest of the previous month's
/// first day, the role's creation, and the last known check-in; ends at the
/// previous month's last day. None when the role is too new to have a gap.
pub fn backfill_range(
    today: NaiveDate,
    role_created: NaiveDate,
    last_check_in: Option<NaiveDate>,
) -> Option<BackfillRange> {
    let month_start = today.with_day(1)?;
    let prev_end = month_start - Duration::days(1);
    let prev_start = prev_end.with_day(1)?;

    let mut start = prev_start.max(role_created);
    if let Some(last) = last_check_in {
        start = start.max(last);
    }
    (start <= prev_end).then_some(BackfillRange {
        start,
        end: prev_end,
    })
}

/// Mark weekly-off, holiday and leave days across the range, all at full
/// credit. Days with existing check-in data keep it; only flags and credit
/// are layered on.
pub fn mark_days(
    days: &mut DayMap,
    range: BackfillRange,
    weekly_off: Option<Weekday>,
    holidays: &[NaiveDate],
    leaves: &[LeaveRecord],
) {
    let mut date = range.start;
    while date <= range.end {
        let is_weekly_off = weekly_off.is_some_and(|w| date.weekday() == w);
        let is_holiday = holidays.contains(&date);

        if is_weekly_off || is_holiday {
            let day = days.entry(date.day()).or_default();
            day.weekly_off |= is_weekly_off;
            day.holiday |= is_holiday;
            day.attendance = 1;
        }
        date += Duration::days(1);
    }

    for leave in leaves.iter().filter(|l| !l.cancelled) {
        let mut date = leave.start_date.max(range.start);
        let end = leave.end_date.min(range.end);
        while date <= end {
            let day = days.entry(date.day()).or_default();
            if leave.is_ar {
                day.on_ar = true;
            } else {
                day.on_leave = true;
                day.leave_type = leave.leave_type.clone();
            }
            day.attendance = 1;
            date += Duration::days(1);
        }
    }
}

async fn overlapping_leaves(
    pool: &PgPool,
    office_id: Uuid,
    user_phone: &str,
    range: BackfillRange,
) -> AppResult<Vec<LeaveRecord>> {
    let rows = sqlx::query_as::<_, LeaveRecord>(
        r#"SELECT office_id, employee_phone, activity_id, leave_type, reason,
                  start_date, end_date, is_ar, cancelled
           FROM leaves
           WHERE office_id = $1
             AND employee_phone = $2
             AND cancelled = FALSE
             AND start_date <= $3
             AND end_date >= $4"#,
    )
    .bind(office_id)
    .bind(user_phone)
    .bind(range.end)
    .bind(range.start)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn branch_venue(
    pool: &PgPool,
    office_id: Uuid,
    identifier: &str,
) -> AppResult<Option<VenueRecord>> {
    let venue = sqlx::query_as::<_, VenueRecord>(
        r#"SELECT identifier, lat, lng, weekly_off, holidays
           FROM venues
           WHERE office_id = $1 AND template = 'branch' AND identifier = $2
           LIMIT 1"#,
    )
    .bind(office_id)
    .bind(identifier)
    .fetch_optional(pool)
    .await?;
    Ok(venue)
}

/// Complete the previous month's record in one staged merge. Caller has
/// already verified the trigger: freshly-created current record, role
/// snapshot present, last check-in in a different month.
pub async fn run(
    pool: &PgPool,
    batch: &mut BatchWriter,
    event: &AddendumEvent,
    role: &RoleSnapshot,
    tz: Tz,
) -> AppResult<()> {
    let today = event
        .event_timestamp
        .with_timezone(&tz)
        .date_naive();
    let role_created = role.created_at.with_timezone(&tz).date_naive();
    let last_check_in = role
        .last_check_in_at
        .map(|t| t.with_timezone(&tz).date_naive());

    let Some(range) = backfill_range(today, role_created, last_check_in) else {
        debug!(user_phone = %event.user_phone, "no previous-month gap to fill");
        return Ok(());
    };

    let (weekly_off, holidays) = match role.base_location.as_deref() {
        Some(base) => match branch_venue(pool, event.office_id, base).await? {
            Some(venue) => {
                let weekday = venue
                    .weekly_off
                    .as_deref()
                    .and_then(|w| Weekday::from_str(w).ok());
                (weekday, venue.holidays.0.clone())
            }
            None => (None, Vec::new()),
        },
        None => (None, Vec::new()),
    };

    let leaves = overlapping_leaves(pool, event.office_id, &event.user_phone, range).await?;

    let month = range.start.month();
    let year = range.start.year();
    let mut record =
        attendance::load_record(pool, event.office_id, &event.user_phone, month, year)
            .await?
            .unwrap_or_else(|| {
                AttendanceRecord::fresh(event.office_id, &event.user_phone, month, year, role.clone())
            });

    mark_days(&mut record.days, range, weekly_off, &holidays, &leaves);

    info!(
        user_phone = %event.user_phone,
        start = %range.start,
        end = %range.end,
        leaves = leaves.len(),
        "backfilled previous month"
    );
    batch.push(WriteOp::UpsertAttendance(Box::new(record)));
    Ok(())
}
