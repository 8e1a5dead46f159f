// src/services/ledger.rs
//
// Addendum ledger: the append-only raw-event log every other record derives
// from. Appending enriches the event with day/month/year in the activity's
// timezone; redelivery of the same event id is a no-op at the store.

use crate::models::{AddendumEvent, EventEnvelope, Geopoint};
use crate::services::batch::{BatchWriter, WriteOp};
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::errors::AppResult;

/// Resolve the zone an event's calendar fields are derived in.
pub fn resolve_timezone(activity_tz: Option<&str>, fallback: Tz) -> Tz {
    match activity_tz {
        None => fallback,
        Some(name) => name.parse().unwrap_or_else(|_| {
            warn!(timezone = name, "unparseable activity timezone, using fallback");
            fallback
        }),
    }
}

/// Build the enriched addendum from an incoming envelope. Everything derived
/// here comes from the event itself, never from a later one.
pub fn build_addendum(envelope: &EventEnvelope, server_now: DateTime<Utc>, tz: Tz) -> AddendumEvent {
    let local = envelope.timestamp.with_timezone(&tz);

    AddendumEvent {
        id: envelope.event_id,
        office_id: envelope.office_id,
        activity_id: envelope.activity_id,
        user_phone: envelope.user_phone.clone(),
        account_id: envelope.account_id,
        action: envelope.action,
        event_timestamp: envelope.timestamp,
        server_timestamp: server_now,
        geopoint: envelope.geopoint,
        accuracy_meters: envelope.accuracy_meters,
        activity: envelope.activity.clone(),
        is_support_request: envelope.is_support_request,
        is_admin_request: envelope.is_admin_request,
        is_auto_generated: envelope.is_auto_generated,
        day: local.day(),
        month: local.month(),
        year: local.year(),
        distance_accurate: None,
        venue_identifier: None,
        venue_geopoint: None,
    }
}

/// Stage the single append for this event.
pub fn stage_append(batch: &mut BatchWriter, event: &AddendumEvent) {
    batch.push(WriteOp::InsertAddendum(Box::new(event.clone())));
}

/// Whether an addendum with this id is already committed. A hit means the
/// event is a redelivery and its ledger side effects have already landed.
pub async fn addendum_exists(pool: &PgPool, id: Uuid) -> AppResult<bool> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM addendum_events WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

/// Location of the employee's most recent located addendum before the
/// given instant. Feeds the open-leg resolution.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PreviousAddendum {
    pub lat: f64,
    pub lng: f64,
}

impl PreviousAddendum {
    pub fn geopoint(&self) -> Geopoint {
        Geopoint::new(self.lat, self.lng)
    }
}

pub async fn previous_located_addendum(
    pool: &PgPool,
    office_id: Uuid,
    user_phone: &str,
    before: DateTime<Utc>,
) -> AppResult<Option<PreviousAddendum>> {
    let prev = sqlx::query_as::<_, PreviousAddendum>(
        r#"SELECT lat, lng
           FROM addendum_events
           WHERE office_id = $1
             AND user_phone = $2
             AND event_timestamp < $3
             AND lat IS NOT NULL
             AND lng IS NOT NULL
           ORDER BY event_timestamp DESC
           LIMIT 1"#,
    )
    .bind(office_id)
    .bind(user_phone)
    .bind(before)
    .fetch_optional(pool)
    .await?;
    Ok(prev)
}
