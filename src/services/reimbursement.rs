// src/services/reimbursement.rs
//
// Kilometre-allowance state machine and daily-allowance evaluator.
//
// The travel machine keeps at most one open return leg per employee-day: an
// intermediate entry priced as an assumed trip back to the start point. The
// next qualifying event re-prices that leg with the real travelled distance
// from the distance matrix and opens a fresh return leg from the new spot.

use crate::errors::AppResult;
use crate::models::{
    Action, AddendumEvent, AllowanceRecord, Geopoint, ReimbursementEntry, ReimbursementType,
    RoleSnapshot, VenueRecord,
};
use crate::services::batch::{BatchWriter, WriteOp};
use crate::services::geo;
use crate::services::ledger;
use crate::services::maps::MapsProvider;
use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

/// Trips shorter than this are not billable and legs travelled less than
/// this are not resolvable.
pub const MIN_BILLABLE_KM: Decimal = dec!(1);

// ─── State machine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum LegState {
    NoOpenLeg,
    OpenLeg(ReimbursementEntry),
}

#[derive(Debug, Clone)]
pub struct NewLeg {
    pub from: Geopoint,
    pub to: Geopoint,
    pub from_identifier: Option<String>,
    pub to_identifier: Option<String>,
    pub distance_km: Decimal,
    pub amount: Decimal,
    pub intermediate: bool,
}

#[derive(Debug, Clone)]
pub struct CloseLeg {
    pub id: Uuid,
    pub amount: Decimal,
    pub distance_km: Decimal,
    pub current: Geopoint,
    pub current_identifier: Option<String>,
}

/// Planned ledger mutations for one qualifying event.
#[derive(Debug, Clone)]
pub enum LegPlan {
    /// Nothing billable happened.
    Stay,
    /// First billable movement of the day: a finalized outbound leg plus the
    /// assumed return leg, both at the estimated distance.
    Open { outbound: NewLeg, inbound: NewLeg },
    /// Re-price the open leg with the real travelled distance, then open a
    /// fresh assumed return leg from the new location.
    RollForward { close: CloseLeg, reopen: NewLeg },
}

#[derive(Debug, Clone)]
pub struct LegContext {
    pub rate: Decimal,
    pub start_point: Geopoint,
    pub start_identifier: Option<String>,
    pub current: Geopoint,
    pub current_identifier: Option<String>,
    /// Haversine start-point → current, the best estimate available now.
    pub estimated_km: Decimal,
    /// Real distance travelled since the previous event, when the distance
    /// matrix knows a route.
    pub travelled_km: Option<Decimal>,
}

/// Pure transition function: state × context → planned mutations.
pub fn plan_leg_transition(state: &LegState, ctx: &LegContext) -> LegPlan {
    match state {
        LegState::NoOpenLeg => {
            if ctx.estimated_km < MIN_BILLABLE_KM {
                return LegPlan::Stay;
            }
            let amount = (ctx.rate * ctx.estimated_km).round_dp(2);
            LegPlan::Open {
                outbound: NewLeg {
                    from: ctx.start_point,
                    to: ctx.current,
                    from_identifier: ctx.start_identifier.clone(),
                    to_identifier: ctx.current_identifier.clone(),
                    distance_km: ctx.estimated_km,
                    amount,
                    intermediate: false,
                },
                inbound: NewLeg {
                    from: ctx.current,
                    to: ctx.start_point,
                    from_identifier: ctx.current_identifier.clone(),
                    to_identifier: ctx.start_identifier.clone(),
                    distance_km: ctx.estimated_km,
                    amount,
                    intermediate: true,
                },
            }
        }
        LegState::OpenLeg(entry) => {
            // No known route means the leg cannot be resolved yet.
            let Some(travelled) = ctx.travelled_km else {
                return LegPlan::Stay;
            };
            // Spurious zero-distance closures are skipped outright.
            if travelled < MIN_BILLABLE_KM {
                return LegPlan::Stay;
            }
            let reopen_amount = (ctx.rate * ctx.estimated_km).round_dp(2);
            LegPlan::RollForward {
                close: CloseLeg {
                    id: entry.id,
                    amount: (ctx.rate * travelled).round_dp(2),
                    distance_km: travelled,
                    current: ctx.current,
                    current_identifier: ctx.current_identifier.clone(),
                },
                reopen: NewLeg {
                    from: ctx.current,
                    to: ctx.start_point,
                    from_identifier: ctx.current_identifier.clone(),
                    to_identifier: ctx.start_identifier.clone(),
                    distance_km: ctx.estimated_km,
                    amount: reopen_amount,
                    intermediate: true,
                },
            }
        }
    }
}

// ─── Travel processing ────────────────────────────────────────────────────────

fn leg_entry(event: &AddendumEvent, leg: &NewLeg) -> ReimbursementEntry {
    let now = Utc::now();
    ReimbursementEntry {
        id: Uuid::new_v4(),
        office_id: event.office_id,
        entry_type: ReimbursementType::KmAllowance,
        name: None,
        day: event.day as i32,
        month: event.month as i32,
        year: event.year,
        employee_phone: event.user_phone.clone(),
        activity_id: Some(event.activity_id),
        amount: leg.amount,
        intermediate: leg.intermediate,
        previous_lat: Some(leg.from.lat),
        previous_lng: Some(leg.from.lng),
        current_lat: Some(leg.to.lat),
        current_lng: Some(leg.to.lng),
        previous_identifier: leg.from_identifier.clone(),
        current_identifier: leg.to_identifier.clone(),
        distance_km: Some(leg.distance_km),
        created_at: now,
        updated_at: now,
    }
}

fn stage_plan(batch: &mut BatchWriter, event: &AddendumEvent, plan: LegPlan) {
    match plan {
        LegPlan::Stay => {}
        LegPlan::Open { outbound, inbound } => {
            batch.push(WriteOp::InsertReimbursement(Box::new(leg_entry(event, &outbound))));
            batch.push(WriteOp::InsertReimbursement(Box::new(leg_entry(event, &inbound))));
        }
        LegPlan::RollForward { close, reopen } => {
            batch.push(WriteOp::FinalizeReimbursement {
                id: close.id,
                amount: close.amount,
                distance_km: close.distance_km,
                current: close.current,
                current_identifier: close.current_identifier,
            });
            batch.push(WriteOp::InsertReimbursement(Box::new(leg_entry(event, &reopen))));
        }
    }
}

/// Open return leg for this employee-day, if any. The partial unique index
/// guarantees at most one exists.
async fn open_leg(pool: &PgPool, event: &AddendumEvent) -> AppResult<Option<ReimbursementEntry>> {
    let entry = sqlx::query_as::<_, ReimbursementEntry>(
        r#"SELECT id, office_id, entry_type, name, day, month, year, employee_phone,
                  activity_id, amount, intermediate, previous_lat, previous_lng,
                  current_lat, current_lng, previous_identifier, current_identifier,
                  distance_km, created_at, updated_at
           FROM reimbursement_entries
           WHERE office_id = $1
             AND employee_phone = $2
             AND entry_type = 'km_allowance'
             AND intermediate = TRUE
             AND day = $3 AND month = $4 AND year = $5"#,
    )
    .bind(event.office_id)
    .bind(&event.user_phone)
    .bind(event.day as i32)
    .bind(event.month as i32)
    .bind(event.year)
    .fetch_optional(pool)
    .await?;
    Ok(entry)
}

/// Branch venue for the role's base location, the fallback start point.
async fn base_location_venue(
    pool: &PgPool,
    office_id: Uuid,
    base_location: &str,
) -> AppResult<Option<VenueRecord>> {
    let venue = sqlx::query_as::<_, VenueRecord>(
        r#"SELECT identifier, lat, lng, weekly_off, holidays
           FROM venues
           WHERE office_id = $1 AND template = 'branch' AND identifier = $2
           LIMIT 1"#,
    )
    .bind(office_id)
    .bind(base_location)
    .fetch_optional(pool)
    .await?;
    Ok(venue)
}

/// Whether an event drives the state machine at all. Support/admin traffic,
/// roles without a KM rate, and (for scheduled-only roles) anything but a
/// check-in are quietly inapplicable. `already_settled` is true when this
/// event's addendum is already committed: a redelivery was billed by its
/// first pass and must not move the ledger again.
pub fn travel_applies(event: &AddendumEvent, role: &RoleSnapshot, already_settled: bool) -> bool {
    !already_settled
        && !event.is_support_request
        && !event.is_admin_request
        && role.km_rate.is_some()
        && (!role.scheduled_only || event.action == Action::CheckIn)
}

/// Drive the state machine for one located event.
pub async fn process_travel(
    pool: &PgPool,
    maps: &dyn MapsProvider,
    batch: &mut BatchWriter,
    event: &AddendumEvent,
    point: Geopoint,
    role: &RoleSnapshot,
) -> AppResult<()> {
    let already_settled = ledger::addendum_exists(pool, event.id).await?;
    if !travel_applies(event, role, already_settled) {
        if already_settled {
            debug!(addendum_id = %event.id, "redelivered event, km allowance already settled");
        }
        return Ok(());
    }
    let Some(rate) = role.km_rate else {
        return Ok(());
    };

    let (start_point, start_identifier) = match role.start_point() {
        Some(p) => (p, role.base_location.clone()),
        None => {
            let Some(base) = role.base_location.as_deref() else {
                debug!(user_phone = %event.user_phone, "no start point configured, km allowance skipped");
                return Ok(());
            };
            match base_location_venue(pool, event.office_id, base).await? {
                Some(venue) => (venue.geopoint(), Some(venue.identifier)),
                None => {
                    debug!(base_location = base, "base location has no venue, km allowance skipped");
                    return Ok(());
                }
            }
        }
    };

    let estimated_km = Decimal::from_f64(geo::haversine_km(start_point, point))
        .unwrap_or(Decimal::ZERO)
        .round_dp(3);

    let state = match open_leg(pool, event).await? {
        Some(entry) => LegState::OpenLeg(entry),
        None => LegState::NoOpenLeg,
    };

    // The real travelled distance only matters when there is a leg to close.
    let travelled_km = match &state {
        LegState::NoOpenLeg => None,
        LegState::OpenLeg(entry) => {
            let origin = ledger::previous_located_addendum(
                pool,
                event.office_id,
                &event.user_phone,
                event.event_timestamp,
            )
            .await?
            .map(|prev| prev.geopoint())
            .or_else(|| match (entry.previous_lat, entry.previous_lng) {
                (Some(lat), Some(lng)) => Some(Geopoint::new(lat, lng)),
                _ => None,
            });
            match origin {
                Some(from) => maps.travelled_distance_km(from, point).await?,
                None => None,
            }
        }
    };

    let ctx = LegContext {
        rate,
        start_point,
        start_identifier,
        current: point,
        current_identifier: event.venue_identifier.clone(),
        estimated_km,
        travelled_km,
    };
    stage_plan(batch, event, plan_leg_transition(&state, &ctx));
    Ok(())
}

// ─── Daily allowances ─────────────────────────────────────────────────────────

async fn office_allowances(pool: &PgPool, office_id: Uuid) -> AppResult<Vec<AllowanceRecord>> {
    let rows = sqlx::query_as::<_, AllowanceRecord>(
        r#"SELECT office_id, name, amount, start_time, end_time, scheduled_only
           FROM allowances
           WHERE office_id = $1"#,
    )
    .bind(office_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn allowance_already_granted(
    pool: &PgPool,
    event: &AddendumEvent,
    name: &str,
) -> AppResult<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"SELECT id FROM reimbursement_entries
           WHERE office_id = $1
             AND employee_phone = $2
             AND entry_type = 'daily_allowance'
             AND name = $3
             AND day = $4 AND month = $5 AND year = $6
           LIMIT 1"#,
    )
    .bind(event.office_id)
    .bind(&event.user_phone)
    .bind(name)
    .bind(event.day as i32)
    .bind(event.month as i32)
    .bind(event.year)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Whether one allowance covers this event: a scheduled-only allowance sees
/// check-ins only, and the event's local time must fall inside the window,
/// both endpoints included.
pub fn allowance_applies(allowance: &AllowanceRecord, action: Action, local_time: NaiveTime) -> bool {
    if allowance.scheduled_only && action != Action::CheckIn {
        return false;
    }
    local_time >= allowance.start_time && local_time <= allowance.end_time
}

/// Grant each configured daily allowance at most once per employee per day,
/// gated by its local time window. The read is a fast path; the unique index
/// on the ledger is what actually holds the line under concurrent delivery.
pub async fn evaluate_allowances(
    pool: &PgPool,
    batch: &mut BatchWriter,
    event: &AddendumEvent,
    tz: Tz,
) -> AppResult<()> {
    let allowances = office_allowances(pool, event.office_id).await?;
    if allowances.is_empty() {
        return Ok(());
    }

    let local_time = event.event_timestamp.with_timezone(&tz).time();

    for allowance in allowances {
        if !allowance_applies(&allowance, event.action, local_time) {
            continue;
        }
        if allowance_already_granted(pool, event, &allowance.name).await? {
            continue;
        }

        let now = Utc::now();
        batch.push(WriteOp::InsertReimbursement(Box::new(ReimbursementEntry {
            id: Uuid::new_v4(),
            office_id: event.office_id,
            entry_type: ReimbursementType::DailyAllowance,
            name: Some(allowance.name.clone()),
            day: event.day as i32,
            month: event.month as i32,
            year: event.year,
            employee_phone: event.user_phone.clone(),
            activity_id: Some(event.activity_id),
            amount: allowance.amount,
            intermediate: false,
            previous_lat: None,
            previous_lng: None,
            current_lat: event.geopoint.map(|g| g.lat),
            current_lng: event.geopoint.map(|g| g.lng),
            previous_identifier: None,
            current_identifier: event.venue_identifier.clone(),
            distance_km: None,
            created_at: now,
            updated_at: now,
        })));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivitySnapshot, TemplateDetail};

    fn ctx(rate: Decimal, estimated: Decimal, travelled: Option<Decimal>) -> LegContext {
        LegContext {
            rate,
            start_point: Geopoint::new(28.70, 77.10),
            start_identifier: Some("HQ Branch".to_string()),
            current: Geopoint::new(28.71, 77.30),
            current_identifier: Some("Client Site".to_string()),
            estimated_km: estimated,
            travelled_km: travelled,
        }
    }

    fn open_entry() -> ReimbursementEntry {
        let now = Utc::now();
        ReimbursementEntry {
            id: Uuid::new_v4(),
            office_id: Uuid::nil(),
            entry_type: ReimbursementType::KmAllowance,
            name: None,
            day: 10,
            month: 3,
            year: 2026,
            employee_phone: "+911234567890".to_string(),
            activity_id: None,
            amount: dec!(90),
            intermediate: true,
            previous_lat: Some(28.71),
            previous_lng: Some(77.30),
            current_lat: Some(28.70),
            current_lng: Some(77.10),
            previous_identifier: Some("Client Site".to_string()),
            current_identifier: Some("HQ Branch".to_string()),
            distance_km: Some(dec!(18)),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn first_movement_opens_two_legs_at_the_estimate() {
        let plan = plan_leg_transition(&LegState::NoOpenLeg, &ctx(dec!(5), dec!(18), None));
        match plan {
            LegPlan::Open { outbound, inbound } => {
                assert!(!outbound.intermediate);
                assert!(inbound.intermediate);
                // rate 5 × 18 km, both directions.
                assert_eq!(outbound.amount, dec!(90.00));
                assert_eq!(inbound.amount, dec!(90.00));
                assert_eq!(inbound.to, Geopoint::new(28.70, 77.10));
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn short_trips_are_not_billable() {
        let plan = plan_leg_transition(&LegState::NoOpenLeg, &ctx(dec!(5), dec!(0.4), None));
        assert!(matches!(plan, LegPlan::Stay));
    }

    #[test]
    fn next_event_reprices_the_open_leg_with_real_distance() {
        let entry = open_entry();
        let id = entry.id;
        let plan = plan_leg_transition(
            &LegState::OpenLeg(entry),
            &ctx(dec!(5), dec!(18), Some(dec!(5))),
        );
        match plan {
            LegPlan::RollForward { close, reopen } => {
                assert_eq!(close.id, id);
                // rate 5 × actual 5 km.
                assert_eq!(close.amount, dec!(25.00));
                assert!(reopen.intermediate);
                assert_eq!(reopen.amount, dec!(90.00));
            }
            other => panic!("expected RollForward, got {other:?}"),
        }
    }

    #[test]
    fn sub_kilometre_travel_leaves_the_open_leg_alone() {
        let plan = plan_leg_transition(
            &LegState::OpenLeg(open_entry()),
            &ctx(dec!(5), dec!(18), Some(dec!(0.2))),
        );
        assert!(matches!(plan, LegPlan::Stay));
    }

    #[test]
    fn unresolvable_route_leaves_the_open_leg_alone() {
        let plan = plan_leg_transition(
            &LegState::OpenLeg(open_entry()),
            &ctx(dec!(5), dec!(18), None),
        );
        assert!(matches!(plan, LegPlan::Stay));
    }

    #[test]
    fn every_plan_keeps_at_most_one_open_leg() {
        // Open: exactly one intermediate leg is created.
        let open = plan_leg_transition(&LegState::NoOpenLeg, &ctx(dec!(5), dec!(18), None));
        let LegPlan::Open { outbound, inbound } = open else {
            panic!("expected Open");
        };
        assert_eq!(
            [outbound.intermediate, inbound.intermediate]
                .iter()
                .filter(|i| **i)
                .count(),
            1
        );

        // RollForward: one closed, one reopened.
        let roll = plan_leg_transition(
            &LegState::OpenLeg(open_entry()),
            &ctx(dec!(5), dec!(18), Some(dec!(5))),
        );
        let LegPlan::RollForward { reopen, .. } = roll else {
            panic!("expected RollForward");
        };
        assert!(reopen.intermediate);
    }

    fn billable_role() -> RoleSnapshot {
        RoleSnapshot {
            employee_code: "E042".to_string(),
            employee_name: "Asha Verma".to_string(),
            base_location: Some("HQ Branch".to_string()),
            region: None,
            department: None,
            km_rate: Some(dec!(5)),
            minimum_daily_activity_count: 1,
            minimum_working_hours: None,
            scheduled_only: false,
            start_lat: Some(28.70),
            start_lng: Some(77.10),
            location_validation_check: false,
            daily_start_time: None,
            created_at: Utc::now(),
            last_check_in_at: None,
        }
    }

    fn checkin_event() -> AddendumEvent {
        let ts = Utc::now();
        AddendumEvent {
            id: Uuid::new_v4(),
            office_id: Uuid::nil(),
            activity_id: Uuid::new_v4(),
            user_phone: "+911234567890".to_string(),
            account_id: None,
            action: Action::CheckIn,
            event_timestamp: ts,
            server_timestamp: ts,
            geopoint: Some(Geopoint::new(28.71, 77.30)),
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
            day: 10,
            month: 3,
            year: 2026,
            distance_accurate: None,
            venue_identifier: None,
            venue_geopoint: None,
        }
    }

    #[test]
    fn redelivered_event_never_drives_the_machine_again() {
        // First delivery closed the open leg and reopened a fresh one; a
        // second delivery of the same event would re-close that leg at the
        // same distance and keep inflating the ledger.
        let event = checkin_event();
        let role = billable_role();
        assert!(travel_applies(&event, &role, false));
        assert!(!travel_applies(&event, &role, true));
    }

    #[test]
    fn inapplicable_traffic_never_drives_the_machine() {
        let role = billable_role();

        let mut support = checkin_event();
        support.is_support_request = true;
        assert!(!travel_applies(&support, &role, false));

        let mut unpaid = billable_role();
        unpaid.km_rate = None;
        assert!(!travel_applies(&checkin_event(), &unpaid, false));

        let mut scheduled = billable_role();
        scheduled.scheduled_only = true;
        let mut comment = checkin_event();
        comment.action = Action::Comment;
        assert!(!travel_applies(&comment, &scheduled, false));
        assert!(travel_applies(&checkin_event(), &scheduled, false));
    }

    fn allowance(start: (u32, u32), end: (u32, u32), scheduled_only: bool) -> AllowanceRecord {
        AllowanceRecord {
            office_id: Uuid::nil(),
            name: "Lunch".to_string(),
            amount: dec!(150),
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            scheduled_only,
        }
    }

    #[test]
    fn allowance_window_includes_both_endpoints() {
        let lunch = allowance((12, 0), (14, 0), false);
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();

        assert!(!allowance_applies(&lunch, Action::CheckIn, t(11, 59)));
        assert!(allowance_applies(&lunch, Action::CheckIn, t(12, 0)));
        assert!(allowance_applies(&lunch, Action::CheckIn, t(14, 0)));
        assert!(!allowance_applies(&lunch, Action::CheckIn, t(14, 1)));
    }

    #[test]
    fn scheduled_only_allowance_sees_checkins_only() {
        let lunch = allowance((12, 0), (14, 0), true);
        let noon = NaiveTime::from_hms_opt(13, 0, 0).unwrap();

        assert!(allowance_applies(&lunch, Action::CheckIn, noon));
        assert!(!allowance_applies(&lunch, Action::Comment, noon));

        let open = allowance((12, 0), (14, 0), false);
        assert!(allowance_applies(&open, Action::Comment, noon));
    }
}
