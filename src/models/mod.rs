// src/models/mod.rs

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

// ─── Geopoints ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Geopoint {
    pub lat: f64,
    pub lng: f64,
}

impl Geopoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

// ─── Actions & Statuses ───────────────────────────────────────────────────────

// sqlx 0.8: custom Postgres enums need #[sqlx(type_name = "...")] on the enum.
// Wire format keeps the upstream kebab-case action names ("check-in" etc.).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq)]
#[sqlx(type_name = "addendum_action", rename_all = "snake_case")]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Create,
    Update,
    ChangeStatus,
    Share,
    Comment,
    CheckIn,
    Install,
    Signup,
    Other,
}

impl Action {
    /// Actions that never feed attendance or reimbursement. They are logged
    /// to the addendum ledger verbatim and nothing else happens.
    pub fn skips_aggregation(self) -> bool {
        matches!(self, Action::Install | Action::Signup)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityStatus {
    Pending,
    Confirmed,
    Cancelled,
}

// ─── Activity snapshot (denormalized onto every event) ────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Venue {
    pub identifier: String,
    pub geopoint: Option<Geopoint>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScheduleSlot {
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Template-specific payload of an activity, keyed by the template name.
///
/// The upstream store keeps these as an open-ended attachment map; here each
/// variant declares only the fields its handlers consume. Unknown templates
/// fall through to `Other` and are stored but never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "template", rename_all = "kebab-case")]
pub enum TemplateDetail {
    CheckIn,
    Leave {
        leave_type: Option<String>,
        reason: Option<String>,
    },
    AttendanceRegularization {
        reason: Option<String>,
    },
    Branch,
    Customer,
    DailyAllowance {
        name: String,
        amount: Decimal,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActivitySnapshot {
    /// Human-readable office name, denormalized alongside the office id.
    pub office: Option<String>,
    /// IANA zone the activity lives in; events fall back to the configured
    /// default zone when unset.
    pub timezone: Option<String>,
    pub status: Option<ActivityStatus>,
    pub venue: Option<Venue>,
    #[serde(default)]
    pub schedule: Vec<ScheduleSlot>,
    #[serde(flatten)]
    pub detail: TemplateDetail,
}

// ─── Ingest envelope (the activity lifecycle event source) ────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EventEnvelope {
    /// Upstream event id; redelivery of the same id is a no-op.
    pub event_id: Uuid,
    pub office_id: Uuid,
    pub activity_id: Uuid,
    pub user_phone: String,
    pub account_id: Option<Uuid>,
    pub action: Action,
    /// Device-reported timestamp.
    pub timestamp: DateTime<Utc>,
    pub geopoint: Option<Geopoint>,
    pub accuracy_meters: Option<f64>,
    /// After-snapshot of the activity this event concerns.
    pub activity: ActivitySnapshot,
    /// Status from the before-snapshot, for cancellation detection.
    pub previous_status: Option<ActivityStatus>,
    #[serde(default)]
    pub is_support_request: bool,
    #[serde(default)]
    pub is_admin_request: bool,
    #[serde(default)]
    pub is_auto_generated: bool,
}

// ─── Addendum event (immutable ledger entry) ──────────────────────────────────

/// One fully-enriched addendum. Built in memory from the envelope, enriched
/// with fields derived from itself (never from a later event), then written
/// exactly once.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AddendumEvent {
    pub id: Uuid,
    pub office_id: Uuid,
    pub activity_id: Uuid,
    pub user_phone: String,
    pub account_id: Option<Uuid>,
    pub action: Action,
    pub event_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    pub geopoint: Option<Geopoint>,
    pub accuracy_meters: Option<f64>,
    pub activity: ActivitySnapshot,
    pub is_support_request: bool,
    pub is_admin_request: bool,
    pub is_auto_generated: bool,
    // Derived in the activity's timezone.
    pub day: u32,
    pub month: u32,
    pub year: i32,
    // Classifier output, attached before the single write.
    pub distance_accurate: Option<bool>,
    pub venue_identifier: Option<String>,
    pub venue_geopoint: Option<Geopoint>,
}

// ─── Role snapshot ────────────────────────────────────────────────────────────

/// Point-in-time copy of an employee's policy attributes. Copied into ledger
/// records at write time so historical entries stay stable when the role
/// changes later.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct RoleSnapshot {
    pub employee_code: String,
    pub employee_name: String,
    pub base_location: Option<String>,
    pub region: Option<String>,
    pub department: Option<String>,
    pub km_rate: Option<Decimal>,
    pub minimum_daily_activity_count: i32,
    pub minimum_working_hours: Option<f64>,
    pub scheduled_only: bool,
    pub start_lat: Option<f64>,
    pub start_lng: Option<f64>,
    pub location_validation_check: bool,
    pub daily_start_time: Option<NaiveTime>,
    pub created_at: DateTime<Utc>,
    pub last_check_in_at: Option<DateTime<Utc>>,
}

impl RoleSnapshot {
    pub fn start_point(&self) -> Option<Geopoint> {
        match (self.start_lat, self.start_lng) {
            (Some(lat), Some(lng)) => Some(Geopoint::new(lat, lng)),
            _ => None,
        }
    }
}

// ─── Day attendance ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct WorkingHours {
    pub first_check_in: Option<DateTime<Utc>>,
    pub last_check_in: Option<DateTime<Utc>>,
    pub num_check_ins: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AddendumRef {
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    pub addendum_id: Uuid,
}

/// One calendar day inside a monthly attendance record.
///
/// Invariants: `addendum` is sorted ascending by timestamp after every
/// mutation, and an `addendum_id` never appears twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DayAttendance {
    /// Attendance credit for the day: 0 or 1.
    pub attendance: u8,
    #[serde(default)]
    pub working: WorkingHours,
    #[serde(default)]
    pub addendum: Vec<AddendumRef>,
    #[serde(default)]
    pub on_leave: bool,
    #[serde(default)]
    pub on_ar: bool,
    #[serde(default)]
    pub holiday: bool,
    #[serde(default)]
    pub weekly_off: bool,
    #[serde(default)]
    pub is_late: bool,
    pub leave_type: Option<String>,
    pub reason: Option<String>,
}

impl DayAttendance {
    /// Leave, regularization, holiday and weekly-off all force full credit.
    pub fn has_override(&self) -> bool {
        self.on_leave || self.on_ar || self.holiday || self.weekly_off
    }
}

pub type DayMap = BTreeMap<u32, DayAttendance>;

// ─── Attendance record ────────────────────────────────────────────────────────

/// Keyed by (office, employee, month, year); the natural key is the
/// identity, there is no surrogate id.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct AttendanceRecord {
    pub office_id: Uuid,
    pub employee_phone: String,
    pub month: i32,
    pub year: i32,
    #[schema(value_type = RoleSnapshot)]
    pub role: Json<RoleSnapshot>,
    #[schema(value_type = Object)]
    pub days: Json<DayMap>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttendanceRecord {
    pub fn fresh(
        office_id: Uuid,
        employee_phone: &str,
        month: u32,
        year: i32,
        role: RoleSnapshot,
    ) -> Self {
        let now = Utc::now();
        Self {
            office_id,
            employee_phone: employee_phone.to_string(),
            month: month as i32,
            year,
            role: Json(role),
            days: Json(DayMap::new()),
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Reimbursement ledger ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, ToSchema, PartialEq, Eq)]
#[sqlx(type_name = "reimbursement_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReimbursementType {
    DailyAllowance,
    KmAllowance,
    Claim,
}

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct ReimbursementEntry {
    pub id: Uuid,
    pub office_id: Uuid,
    pub entry_type: ReimbursementType,
    /// Allowance name for daily-allowance entries.
    pub name: Option<String>,
    pub day: i32,
    pub month: i32,
    pub year: i32,
    pub employee_phone: String,
    pub activity_id: Option<Uuid>,
    pub amount: Decimal,
    /// True while the entry is an open return leg awaiting resolution.
    pub intermediate: bool,
    pub previous_lat: Option<f64>,
    pub previous_lng: Option<f64>,
    pub current_lat: Option<f64>,
    pub current_lng: Option<f64>,
    pub previous_identifier: Option<String>,
    pub current_identifier: Option<String>,
    pub distance_km: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Collaborator rows (read-only for the engine) ─────────────────────────────

#[derive(Debug, Clone, FromRow)]
pub struct VenueRecord {
    pub identifier: String,
    pub lat: f64,
    pub lng: f64,
    /// Weekday name for branches ("monday" .. "sunday").
    pub weekly_off: Option<String>,
    pub holidays: Json<Vec<NaiveDate>>,
}

impl VenueRecord {
    pub fn geopoint(&self) -> Geopoint {
        Geopoint::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AllowanceRecord {
    pub office_id: Uuid,
    pub name: String,
    pub amount: Decimal,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub scheduled_only: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct LeaveRecord {
    pub office_id: Uuid,
    pub employee_phone: String,
    pub activity_id: Uuid,
    pub leave_type: Option<String>,
    pub reason: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_ar: bool,
    pub cancelled: bool,
}

// ─── Classifier output ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GeoClassification {
    pub distance_accurate: bool,
    pub venue_identifier: String,
    pub venue_geopoint: Option<Geopoint>,
}

// ─── API responses ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, ToSchema)]
pub struct IngestResponse {
    pub addendum_id: Uuid,
    /// False when the action bypasses aggregation (install/signup or no
    /// location outside the leave path).
    pub aggregated: bool,
}
