// src/services/attendance.rs
//
// Attendance aggregator: one record per (office, employee, month, year),
// one entry per calendar day. Merge functions are pure; the service loads
// the row, applies, and stages a single upsert. Re-applying an already-seen
// addendum leaves the record unchanged.

use crate::errors::AppResult;
use crate::models::{
    AddendumEvent, AddendumRef, AttendanceRecord, DayAttendance, DayMap, Geopoint, LeaveRecord,
    RoleSnapshot, TemplateDetail,
};
use crate::services::batch::{BatchWriter, WriteOp};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

/// Deterministic day credit from the role's policy thresholds.
///
/// Hours worked is the span between first and last check-in, fractional.
pub fn status_for_day(
    hours_worked: f64,
    check_in_count: u32,
    minimum_daily_activity_count: i32,
    minimum_working_hours: Option<f64>,
) -> u8 {
    let enough_activity = i64::from(check_in_count) >= i64::from(minimum_daily_activity_count);
    let enough_hours = minimum_working_hours.is_none_or(|min| hours_worked >= min);
    u8::from(enough_activity && enough_hours)
}

/// Span between first and last check-in, in fractional hours.
pub fn hours_worked(day: &DayAttendance) -> f64 {
    match (day.working.first_check_in, day.working.last_check_in) {
        (Some(first), Some(last)) if last > first => {
            (last - first).num_seconds() as f64 / 3600.0
        }
        _ => 0.0,
    }
}

/// Credit for a day under the current flags and thresholds. Leave, AR,
/// holiday and weekly-off override to full credit unconditionally.
pub fn day_credit(day: &DayAttendance, role: &RoleSnapshot) -> u8 {
    if day.has_override() {
        return 1;
    }
    status_for_day(
        hours_worked(day),
        day.working.num_check_ins,
        role.minimum_daily_activity_count,
        role.minimum_working_hours,
    )
}

/// Merge one located event into its day. First check-in is first-write-wins,
/// last is always updated; the addendum list stays deduplicated by id and
/// sorted by timestamp.
pub fn merge_located_event(day: &mut DayAttendance, event: &AddendumEvent, point: Geopoint) {
    if day.working.first_check_in.is_none() {
        day.working.first_check_in = Some(event.event_timestamp);
    }
    day.working.last_check_in = Some(event.event_timestamp);

    if !day.addendum.iter().any(|a| a.addendum_id == event.id) {
        day.addendum.push(AddendumRef {
            timestamp: event.event_timestamp,
            lat: point.lat,
            lng: point.lng,
            addendum_id: event.id,
        });
        day.addendum.sort_by_key(|a| a.timestamp);
    }
    day.working.num_check_ins = day.addendum.len() as u32;
}

/// Late iff a daily start time is configured and the first check-in lands
/// more than the grace period past it, in the activity's zone.
pub fn compute_is_late(
    first_check_in: Option<DateTime<Utc>>,
    role: &RoleSnapshot,
    tz: Tz,
    grace_minutes: i64,
) -> bool {
    match (first_check_in, role.daily_start_time) {
        (Some(first), Some(start)) => {
            let local = first.with_timezone(&tz).time();
            // NaiveTime addition wraps at midnight; a window that spills
            // into the next day cannot be exceeded on this one.
            let (threshold, wrap_secs) = start.overflowing_add_signed(Duration::minutes(grace_minutes));
            wrap_secs == 0 && local > threshold
        }
        _ => false,
    }
}

/// Recompute credit for every day strictly before `today`. Events can arrive
/// in any order within the month, so earlier days are corrected from their
/// stored state on every pass rather than trusting incremental counters.
pub fn recompute_prior_days(days: &mut DayMap, today: u32, role: &RoleSnapshot) {
    for (day, entry) in days.iter_mut() {
        if *day < today {
            entry.attendance = day_credit(entry, role);
        }
    }
}

/// Whether a classified event may earn attendance for this role. Employees
/// under strict location validation only accrue from check-ins proven to be
/// within tolerance of their venue; unclassified events get the benefit of
/// the doubt.
pub fn counts_for_attendance(role: &RoleSnapshot, distance_accurate: Option<bool>) -> bool {
    !role.location_validation_check || distance_accurate != Some(false)
}

/// Apply one located event to the month's record. Returns true when the
/// record did not exist before this pass (the backfill trigger).
pub fn apply_event(
    record: Option<AttendanceRecord>,
    event: &AddendumEvent,
    point: Geopoint,
    role: &RoleSnapshot,
    tz: Tz,
    grace_minutes: i64,
) -> (AttendanceRecord, bool) {
    let created = record.is_none();
    let mut record = record.unwrap_or_else(|| {
        AttendanceRecord::fresh(
            event.office_id,
            &event.user_phone,
            event.month,
            event.year,
            role.clone(),
        )
    });

    let day = record.days.entry(event.day).or_default();
    merge_located_event(day, event, point);
    day.is_late = compute_is_late(day.working.first_check_in, role, tz, grace_minutes);
    day.attendance = day_credit(day, role);

    recompute_prior_days(&mut record.days, event.day, role);

    (record, created)
}

// ─── Leave / regularization entry path ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveKind {
    Leave,
    Regularization,
}

/// Mark or clear one day of a leave span. A cancellation drops the flag and
/// recomputes credit from the raw check-in data instead of assuming 1.
pub fn apply_leave_day(
    day: &mut DayAttendance,
    kind: LeaveKind,
    leave_type: Option<&str>,
    reason: Option<&str>,
    cancelled: bool,
    role: &RoleSnapshot,
) {
    match kind {
        LeaveKind::Leave => day.on_leave = !cancelled,
        LeaveKind::Regularization => day.on_ar = !cancelled,
    }
    if cancelled {
        day.leave_type = None;
        day.reason = None;
    } else {
        day.leave_type = leave_type.map(str::to_string);
        day.reason = reason.map(str::to_string);
    }
    day.attendance = day_credit(day, role);
}

/// Expand the activity's schedule slots into local calendar dates.
pub fn scheduled_dates(event: &AddendumEvent, tz: Tz) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = Vec::new();
    for slot in &event.activity.schedule {
        let mut date = slot.start_time.with_timezone(&tz).date_naive();
        let end = slot.end_time.with_timezone(&tz).date_naive();
        while date <= end {
            if !dates.contains(&date) {
                dates.push(date);
            }
            date += Duration::days(1);
        }
    }
    dates.sort();
    dates
}

// ─── Persistence ──────────────────────────────────────────────────────────────

pub async fn load_record(
    pool: &PgPool,
    office_id: Uuid,
    user_phone: &str,
    month: u32,
    year: i32,
) -> AppResult<Option<AttendanceRecord>> {
    let record = sqlx::query_as::<_, AttendanceRecord>(
        r#"SELECT office_id, employee_phone, month, year, role, days, created_at, updated_at
           FROM attendance_records
           WHERE office_id = $1 AND employee_phone = $2 AND month = $3 AND year = $4"#,
    )
    .bind(office_id)
    .bind(user_phone)
    .bind(month as i32)
    .bind(year)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn fetch_role(
    pool: &PgPool,
    office_id: Uuid,
    user_phone: &str,
) -> AppResult<Option<RoleSnapshot>> {
    let role = sqlx::query_as::<_, RoleSnapshot>(
        r#"SELECT employee_code, employee_name, base_location, region, department,
                  km_rate, minimum_daily_activity_count, minimum_working_hours,
                  scheduled_only, start_lat, start_lng, location_validation_check,
                  daily_start_time, created_at, last_check_in_at
           FROM roles
           WHERE office_id = $1 AND user_phone = $2"#,
    )
    .bind(office_id)
    .bind(user_phone)
    .fetch_optional(pool)
    .await?;
    Ok(role)
}

/// Load-apply-stage for one located event. Returns whether the month record
/// was freshly created.
pub async fn apply_and_stage(
    pool: &PgPool,
    batch: &mut BatchWriter,
    event: &AddendumEvent,
    point: Geopoint,
    role: &RoleSnapshot,
    tz: Tz,
    grace_minutes: i64,
) -> AppResult<bool> {
    let existing = load_record(pool, event.office_id, &event.user_phone, event.month, event.year).await?;
    let (record, created) = apply_event(existing, event, point, role, tz, grace_minutes);
    batch.push(WriteOp::UpsertAttendance(Box::new(record)));
    Ok(created)
}

/// Leave / regularization / attendance-status-change entry path: mark every
/// scheduled date across however many month records the span touches, and
/// keep the leave span row current for backfill.
pub async fn apply_leave_and_stage(
    pool: &PgPool,
    batch: &mut BatchWriter,
    event: &AddendumEvent,
    role: &RoleSnapshot,
    tz: Tz,
    cancelled: bool,
) -> AppResult<()> {
    let (kind, leave_type, reason) = match &event.activity.detail {
        TemplateDetail::Leave { leave_type, reason } => {
            (LeaveKind::Leave, leave_type.clone(), reason.clone())
        }
        TemplateDetail::AttendanceRegularization { reason } => {
            (LeaveKind::Regularization, None, reason.clone())
        }
        other => {
            warn!(?other, "leave entry path called for a non-leave template");
            return Ok(());
        }
    };

    let dates = scheduled_dates(event, tz);
    if dates.is_empty() {
        return Ok(());
    }

    // One record per month the span touches.
    let mut by_month: BTreeMap<(i32, u32), Vec<NaiveDate>> = BTreeMap::new();
    for date in &dates {
        by_month
            .entry((date.year(), date.month()))
            .or_default()
            .push(*date);
    }

    for ((year, month), month_dates) in by_month {
        let existing = load_record(pool, event.office_id, &event.user_phone, month, year).await?;
        let mut record = existing.unwrap_or_else(|| {
            AttendanceRecord::fresh(event.office_id, &event.user_phone, month, year, role.clone())
        });

        for date in month_dates {
            let day = record.days.entry(date.day()).or_default();
            apply_leave_day(
                day,
                kind,
                leave_type.as_deref(),
                reason.as_deref(),
                cancelled,
                role,
            );
        }
        batch.push(WriteOp::UpsertAttendance(Box::new(record)));
    }

    if let (Some(first), Some(last)) = (dates.first(), dates.last()) {
        batch.push(WriteOp::UpsertLeave(Box::new(LeaveRecord {
            office_id: event.office_id,
            employee_phone: event.user_phone.clone(),
            activity_id: event.activity_id,
            leave_type,
            reason,
            start_date: *first,
            end_date: *last,
            is_ar: kind == LeaveKind::Regularization,
            cancelled,
        })));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, ActivitySnapshot, WorkingHours};
    use chrono::{NaiveTime, TimeZone};

    fn role(min_count: i32, min_hours: Option<f64>) -> RoleSnapshot {
        RoleSnapshot {
            employee_code: "E042".to_string(),
            employee_name: "Asha Verma".to_string(),
            base_location: Some("HQ Branch".to_string()),
            region: None,
            department: None,
            km_rate: None,
            minimum_daily_activity_count: min_count,
            minimum_working_hours: min_hours,
            scheduled_only: false,
            start_lat: None,
            start_lng: None,
            location_validation_check: false,
            daily_start_time: None,
            created_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            last_check_in_at: None,
        }
    }

    fn located_event(id: Uuid, ts: DateTime<Utc>) -> AddendumEvent {
        AddendumEvent {
            id,
            office_id: Uuid::nil(),
            activity_id: Uuid::new_v4(),
            user_phone: "+911234567890".to_string(),
            account_id: None,
            action: Action::CheckIn,
            event_timestamp: ts,
            server_timestamp: ts,
            geopoint: Some(Geopoint::new(28.70, 77.10)),
            accuracy_meters: Some(40.0),
            activity: ActivitySnapshot {
                office: None,
                timezone: Some("Asia/Kolkata".to_string()),
                status: None,
                venue: None,
                schedule: vec![],
                detail: TemplateDetail::CheckIn,
            },
            is_support_request: false,
            is_admin_request: false,
            is_auto_generated: false,
            day: ts.day(),
            month: ts.month(),
            year: ts.year(),
            distance_accurate: None,
            venue_identifier: None,
            venue_geopoint: None,
        }
    }

    const TZ: Tz = chrono_tz::UTC;
    const POINT: Geopoint = Geopoint { lat: 28.70, lng: 77.10 };

    #[test]
    fn two_checkins_over_five_hours_earn_credit() {
        let role = role(2, Some(4.0));
        let first = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        let second = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap());

        let (record, created) = apply_event(None, &first, POINT, &role, TZ, 15);
        assert!(created);
        let (record, created) = apply_event(Some(record), &second, POINT, &role, TZ, 15);
        assert!(!created);

        let day = &record.days[&10];
        assert_eq!(day.attendance, 1);
        assert_eq!(day.working.num_check_ins, 2);
    }

    #[test]
    fn single_checkin_earns_no_credit() {
        let role = role(2, Some(4.0));
        let only = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        let (record, _) = apply_event(None, &only, POINT, &role, TZ, 15);
        assert_eq!(record.days[&10].attendance, 0);
    }

    #[test]
    fn reapplying_the_same_event_changes_nothing() {
        let role = role(1, None);
        let event = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());

        let (record, _) = apply_event(None, &event, POINT, &role, TZ, 15);
        let snapshot = serde_json::to_value(&record.days.0).unwrap();
        let (record, _) = apply_event(Some(record), &event, POINT, &role, TZ, 15);

        let day = &record.days[&10];
        assert_eq!(day.addendum.len(), 1);
        assert_eq!(serde_json::to_value(&record.days.0).unwrap(), snapshot);
    }

    #[test]
    fn out_of_order_events_keep_the_addendum_list_sorted() {
        let role = role(1, None);
        let late = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 17, 0, 0).unwrap());
        let early = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap());
        let middle = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap());

        let (record, _) = apply_event(None, &late, POINT, &role, TZ, 15);
        let (record, _) = apply_event(Some(record), &early, POINT, &role, TZ, 15);
        let (record, _) = apply_event(Some(record), &middle, POINT, &role, TZ, 15);

        let stamps: Vec<_> = record.days[&10].addendum.iter().map(|a| a.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn leave_overrides_credit_regardless_of_checkins() {
        let role = role(5, Some(8.0));
        let mut day = DayAttendance::default();
        apply_leave_day(&mut day, LeaveKind::Leave, Some("sick"), None, false, &role);
        assert_eq!(day.attendance, 1);
        assert!(day.on_leave);
        assert_eq!(day.leave_type.as_deref(), Some("sick"));
    }

    #[test]
    fn cancelling_leave_recomputes_from_raw_checkins() {
        let role = role(2, None);
        let mut day = DayAttendance {
            working: WorkingHours {
                first_check_in: Some(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()),
                last_check_in: Some(Utc.with_ymd_and_hms(2026, 3, 10, 11, 0, 0).unwrap()),
                num_check_ins: 1,
            },
            ..Default::default()
        };
        apply_leave_day(&mut day, LeaveKind::Leave, Some("casual"), None, false, &role);
        assert_eq!(day.attendance, 1);

        apply_leave_day(&mut day, LeaveKind::Leave, Some("casual"), None, true, &role);
        assert!(!day.on_leave);
        // Only one check-in against a minimum of two.
        assert_eq!(day.attendance, 0);
    }

    #[test]
    fn prior_days_are_recomputed_on_every_pass() {
        let role = role(2, None);
        // Day 3 first sees one event (credit 0)...
        let d3_a = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap());
        let (record, _) = apply_event(None, &d3_a, POINT, &role, TZ, 15);
        assert_eq!(record.days[&3].attendance, 0);

        // ...then a second day-3 event arrives after a day-5 event has
        // already rolled the record forward.
        let d5 = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap());
        let (record, _) = apply_event(Some(record), &d5, POINT, &role, TZ, 15);
        let d3_b = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 3, 15, 0, 0).unwrap());
        let (record, _) = apply_event(Some(record), &d3_b, POINT, &role, TZ, 15);

        let (record, _) = apply_event(
            Some(record),
            &located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 5, 17, 0, 0).unwrap()),
            POINT,
            &role,
            TZ,
            15,
        );
        assert_eq!(record.days[&3].attendance, 1);
    }

    #[test]
    fn late_flag_respects_the_grace_window() {
        let mut r = role(1, None);
        r.daily_start_time = Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap());

        let on_time = Utc.with_ymd_and_hms(2026, 3, 10, 9, 10, 0).unwrap();
        assert!(!compute_is_late(Some(on_time), &r, TZ, 15));

        let late = Utc.with_ymd_and_hms(2026, 3, 10, 9, 16, 0).unwrap();
        assert!(compute_is_late(Some(late), &r, TZ, 15));

        assert!(!compute_is_late(None, &r, TZ, 15));
    }

    #[test]
    fn late_grace_window_does_not_wrap_past_midnight() {
        // A start time near midnight pushes the threshold into the next
        // day; nothing on the current day can be late then.
        let mut r = role(1, None);
        r.daily_start_time = Some(NaiveTime::from_hms_opt(23, 50, 0).unwrap());

        let compliant = Utc.with_ymd_and_hms(2026, 3, 10, 23, 55, 0).unwrap();
        assert!(!compute_is_late(Some(compliant), &r, TZ, 15));

        let morning = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        assert!(!compute_is_late(Some(morning), &r, TZ, 15));

        // A window that stays inside the day still flags.
        r.daily_start_time = Some(NaiveTime::from_hms_opt(23, 30, 0).unwrap());
        let past = Utc.with_ymd_and_hms(2026, 3, 10, 23, 50, 0).unwrap();
        assert!(compute_is_late(Some(past), &r, TZ, 15));
    }

    #[test]
    fn strict_location_validation_rejects_inaccurate_checkins() {
        let mut strict = role(1, None);
        strict.location_validation_check = true;

        assert!(counts_for_attendance(&strict, Some(true)));
        assert!(!counts_for_attendance(&strict, Some(false)));
        // Classifier outage: stored unclassified, still counted.
        assert!(counts_for_attendance(&strict, None));

        let lenient = role(1, None);
        assert!(counts_for_attendance(&lenient, Some(false)));
    }

    #[test]
    fn first_checkin_is_first_write_wins() {
        let role = role(1, None);
        let nine = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        let eight = located_event(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap());

        let (record, _) = apply_event(None, &nine, POINT, &role, TZ, 15);
        let (record, _) = apply_event(Some(record), &eight, POINT, &role, TZ, 15);

        let day = &record.days[&10];
        assert_eq!(
            day.working.first_check_in,
            Some(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap())
        );
        assert_eq!(
            day.working.last_check_in,
            Some(Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap())
        );
    }
}
