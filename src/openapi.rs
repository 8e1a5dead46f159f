// src/openapi.rs

use crate::models::{
    Action, ActivitySnapshot, ActivityStatus, AddendumRef, AttendanceRecord, DayAttendance,
    EventEnvelope, Geopoint, IngestResponse, ReimbursementEntry, ReimbursementType, RoleSnapshot,
    ScheduleSlot, TemplateDetail, Venue, WorkingHours,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Attendance System API",
        version = "1.0.0",
        description = "Event-to-ledger aggregation engine: geolocated activity events in, \
            per-employee monthly attendance records and travel/daily-allowance reimbursement \
            ledgers out. Ingestion is idempotent under at-least-once delivery.",
        license(name = "MIT")
    ),
    paths(
        crate::handlers::events::ingest_event,
        crate::handlers::attendance::get_attendance,
        crate::handlers::reimbursement::list_reimbursements,
    ),
    components(
        schemas(
            EventEnvelope, IngestResponse,
            Action, ActivityStatus, ActivitySnapshot, TemplateDetail,
            Venue, Geopoint, ScheduleSlot,
            AttendanceRecord, DayAttendance, WorkingHours, AddendumRef, RoleSnapshot,
            ReimbursementEntry, ReimbursementType,
        )
    ),
    tags(
        (name = "Events", description = "Activity lifecycle event ingestion"),
        (name = "Attendance", description = "Derived monthly attendance records"),
        (name = "Reimbursements", description = "Daily-allowance and kilometre-allowance ledgers"),
    )
)]
pub struct ApiDoc;
