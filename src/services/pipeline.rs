// src/services/pipeline.rs
//
// One aggregation pass per ingested event. Passes are independent tasks;
// passes for the same employee are serialized through a keyed mutex so the
// read-merge-write cycles cannot lose updates. Stage failures are logged
// and contained: a reimbursement error never blocks attendance, and a
// malformed event never wedges the stream.

use crate::errors::AppResult;
use crate::models::{Action, ActivityStatus, AddendumEvent, EventEnvelope, TemplateDetail};
use crate::services::{attendance, backfill, batch::BatchWriter, batch::WriteOp, geo, ledger, reimbursement};
use crate::state::AppState;
use chrono::Utc;
use tracing::{debug, error, info, warn};

/// Entry point for the spawned background pass. All errors end here.
pub async fn run_pass(state: AppState, envelope: EventEnvelope) {
    let office_id = envelope.office_id;
    let activity_id = envelope.activity_id;
    let user_phone = envelope.user_phone.clone();
    let action = envelope.action;

    if let Err(e) = pass(&state, envelope).await {
        error!(
            %office_id,
            %activity_id,
            user_phone = %user_phone,
            ?action,
            error = %e,
            "aggregation pass failed"
        );
    }
    state.release_pass_lock(office_id, &user_phone);
}

fn is_leave_entry(action: Action, detail: &TemplateDetail) -> bool {
    matches!(
        detail,
        TemplateDetail::Leave { .. } | TemplateDetail::AttendanceRegularization { .. }
    ) && matches!(action, Action::Create | Action::ChangeStatus)
}

/// True for the separate leave/regularization entry path, which needs no
/// geolocation.
fn is_leave_path(event: &AddendumEvent) -> bool {
    is_leave_entry(event.action, &event.activity.detail)
}

/// Whether a pass for this envelope will touch any derived ledger.
/// Skippable actions, and location-less events outside the leave entry
/// path, land in the raw log only.
pub fn will_aggregate(envelope: &EventEnvelope) -> bool {
    !envelope.action.skips_aggregation()
        && (is_leave_entry(envelope.action, &envelope.activity.detail)
            || envelope.geopoint.is_some())
}

/// How a leave entry event affects the span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaveDisposition {
    Apply,
    /// Status changed to CANCELLED: reverse the span.
    Cancel,
    /// The before-snapshot was already cancelled, nothing to do.
    Skip,
}

fn leave_disposition(
    action: Action,
    previous: Option<ActivityStatus>,
    current: Option<ActivityStatus>,
) -> LeaveDisposition {
    if action == Action::ChangeStatus && current == Some(ActivityStatus::Cancelled) {
        if previous == Some(ActivityStatus::Cancelled) {
            LeaveDisposition::Skip
        } else {
            LeaveDisposition::Cancel
        }
    } else {
        LeaveDisposition::Apply
    }
}

async fn pass(state: &AppState, envelope: EventEnvelope) -> AppResult<()> {
    let lock = state.pass_lock(envelope.office_id, &envelope.user_phone);
    let _serialized = lock.lock().await;

    let tz = ledger::resolve_timezone(
        envelope.activity.timezone.as_deref(),
        state.config.default_timezone,
    );
    let mut addendum = ledger::build_addendum(&envelope, Utc::now(), tz);
    let mut batch = BatchWriter::new();

    if addendum.action.skips_aggregation() {
        ledger::stage_append(&mut batch, &addendum);
        batch.commit(&state.db).await?;
        return Ok(());
    }

    // Classification is derived from the event itself and attached before
    // its single write. A geocoding outage downgrades to "unclassified",
    // it does not abort the pass.
    if let Some(point) = addendum.geopoint {
        match geo::classify(&state.db, state.maps.as_ref(), &addendum, point).await {
            Ok(classification) => {
                addendum.distance_accurate = Some(classification.distance_accurate);
                addendum.venue_identifier = Some(classification.venue_identifier);
                addendum.venue_geopoint = classification.venue_geopoint;
            }
            Err(e) => warn!(
                addendum_id = %addendum.id,
                error = %e,
                "classification failed, event stored unclassified"
            ),
        }
    }
    ledger::stage_append(&mut batch, &addendum);

    let role = attendance::fetch_role(&state.db, addendum.office_id, &addendum.user_phone).await?;

    if is_leave_path(&addendum) {
        match &role {
            Some(role) => {
                match leave_disposition(
                    addendum.action,
                    envelope.previous_status,
                    addendum.activity.status,
                ) {
                    LeaveDisposition::Skip => debug!(
                        activity_id = %addendum.activity_id,
                        "status change on an already-cancelled leave, skipped"
                    ),
                    disposition => {
                        let cancelled = disposition == LeaveDisposition::Cancel;
                        attendance::apply_leave_and_stage(
                            &state.db, &mut batch, &addendum, role, tz, cancelled,
                        )
                        .await?;
                    }
                }
            }
            None => warn!(
                user_phone = %addendum.user_phone,
                "leave event for an employee without a role, skipped"
            ),
        }
    } else if let Some(point) = addendum.geopoint {
        match &role {
            Some(role) => {
                // Reimbursement first: it consumes the previous addendum,
                // attendance consumes this one.
                if let Err(e) = reimbursement::process_travel(
                    &state.db,
                    state.maps.as_ref(),
                    &mut batch,
                    &addendum,
                    point,
                    role,
                )
                .await
                {
                    error!(addendum_id = %addendum.id, error = %e, "km allowance stage failed");
                }
                if let Err(e) =
                    reimbursement::evaluate_allowances(&state.db, &mut batch, &addendum, tz).await
                {
                    error!(addendum_id = %addendum.id, error = %e, "daily allowance stage failed");
                }

                let attendance_result = if attendance::counts_for_attendance(
                    role,
                    addendum.distance_accurate,
                ) {
                    attendance::apply_and_stage(
                        &state.db,
                        &mut batch,
                        &addendum,
                        point,
                        role,
                        tz,
                        state.config.late_grace_minutes,
                    )
                    .await
                } else {
                    warn!(
                        addendum_id = %addendum.id,
                        user_phone = %addendum.user_phone,
                        "check-in outside venue tolerance, attendance not credited"
                    );
                    Ok(false)
                };

                match attendance_result {
                    Ok(created) => {
                        let today = addendum.event_timestamp.with_timezone(&tz).date_naive();
                        if created && backfill::needs_backfill(today, role, tz) {
                            if let Err(e) =
                                backfill::run(&state.db, &mut batch, &addendum, role, tz).await
                            {
                                error!(addendum_id = %addendum.id, error = %e, "backfill stage failed");
                            }
                        }
                    }
                    Err(e) => {
                        error!(addendum_id = %addendum.id, error = %e, "attendance stage failed")
                    }
                }

                batch.push(WriteOp::TouchRoleCheckIn {
                    office_id: addendum.office_id,
                    user_phone: addendum.user_phone.clone(),
                    at: addendum.event_timestamp,
                });
            }
            None => warn!(
                user_phone = %addendum.user_phone,
                "located event for an employee without a role, ledger only"
            ),
        }
    }

    let ops = batch.commit(&state.db).await?;
    info!(
        addendum_id = %addendum.id,
        user_phone = %addendum.user_phone,
        ops,
        "aggregation pass committed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivitySnapshot, Geopoint};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn addendum(detail: TemplateDetail, action: Action) -> AddendumEvent {
        AddendumEvent {
            id: Uuid::new_v4(),
            office_id: Uuid::nil(),
            activity_id: Uuid::new_v4(),
            user_phone: "+911234567890".to_string(),
            account_id: None,
            action,
            event_timestamp: Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap(),
            server_timestamp: Utc::now(),
            geopoint: Some(Geopoint::new(28.70, 77.10)),
            accuracy_meters: None,
            activity: ActivitySnapshot {
                office: None,
                timezone: None,
                status: None,
                venue: None,
                schedule: vec![],
                detail,
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
    fn leave_templates_take_the_leave_path() {
        let leave = addendum(
            TemplateDetail::Leave {
                leave_type: Some("sick".to_string()),
                reason: None,
            },
            Action::Create,
        );
        assert!(is_leave_path(&leave));

        let ar = addendum(
            TemplateDetail::AttendanceRegularization { reason: None },
            Action::ChangeStatus,
        );
        assert!(is_leave_path(&ar));
    }

    #[test]
    fn checkins_and_leave_comments_do_not_take_the_leave_path() {
        let checkin = addendum(TemplateDetail::CheckIn, Action::CheckIn);
        assert!(!is_leave_path(&checkin));

        let comment = addendum(
            TemplateDetail::Leave {
                leave_type: None,
                reason: None,
            },
            Action::Comment,
        );
        assert!(!is_leave_path(&comment));
    }

    #[test]
    fn only_the_transition_into_cancelled_reverses_a_leave() {
        use ActivityStatus::{Cancelled, Confirmed};

        // Fresh application.
        assert_eq!(
            leave_disposition(Action::Create, None, Some(Confirmed)),
            LeaveDisposition::Apply
        );
        // Confirmed → cancelled reverses the span.
        assert_eq!(
            leave_disposition(Action::ChangeStatus, Some(Confirmed), Some(Cancelled)),
            LeaveDisposition::Cancel
        );
        // A snapshot that was already cancelled before the event carries no
        // transition and must not touch the record.
        assert_eq!(
            leave_disposition(Action::ChangeStatus, Some(Cancelled), Some(Cancelled)),
            LeaveDisposition::Skip
        );
        // Any other status change is a (re-)application.
        assert_eq!(
            leave_disposition(Action::ChangeStatus, Some(Cancelled), Some(Confirmed)),
            LeaveDisposition::Apply
        );
    }

    fn envelope(action: Action, detail: TemplateDetail, geopoint: Option<Geopoint>) -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            office_id: Uuid::nil(),
            activity_id: Uuid::new_v4(),
            user_phone: "+911234567890".to_string(),
            account_id: None,
            action,
            timestamp: Utc::now(),
            geopoint,
            accuracy_meters: None,
            activity: ActivitySnapshot {
                office: None,
                timezone: None,
                status: None,
                venue: None,
                schedule: vec![],
                detail,
            },
            previous_status: None,
            is_support_request: false,
            is_admin_request: false,
            is_auto_generated: false,
        }
    }

    #[test]
    fn location_less_events_outside_the_leave_path_are_log_only() {
        let point = Some(Geopoint::new(28.70, 77.10));

        assert!(will_aggregate(&envelope(Action::CheckIn, TemplateDetail::CheckIn, point)));
        assert!(!will_aggregate(&envelope(Action::CheckIn, TemplateDetail::CheckIn, None)));
        assert!(!will_aggregate(&envelope(Action::Install, TemplateDetail::Other, point)));

        // Leave entries aggregate without a location.
        let leave = TemplateDetail::Leave {
            leave_type: Some("sick".to_string()),
            reason: None,
        };
        assert!(will_aggregate(&envelope(Action::Create, leave, None)));
    }
}
