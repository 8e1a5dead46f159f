// src/services/geo.rs
//
// Geolocation classifier: decides whether a reported check-in location is
// within tolerance of the venue it claims to be at, and which place label
// identifies it.

use crate::errors::AppResult;
use crate::models::{AddendumEvent, GeoClassification, Geopoint, Venue, VenueRecord};
use crate::services::maps::MapsProvider;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Accuracy at or above this many meters is a low-confidence GPS fix and
/// gets the wider tolerance.
const LOW_CONFIDENCE_ACCURACY_M: f64 = 350.0;

/// Great-circle distance between two points, in kilometres.
pub fn haversine_km(a: Geopoint, b: Geopoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Distance tolerance in km for a reported accuracy (meters).
///
/// Fixes reported as better than 350 m get the tight 0.5 km tolerance;
/// anything else, including a missing accuracy, gets 1 km.
pub fn tolerance_km(accuracy_meters: Option<f64>) -> f64 {
    match accuracy_meters {
        Some(acc) if acc < LOW_CONFIDENCE_ACCURACY_M => 0.5,
        _ => 1.0,
    }
}

/// Bucket key used to find venues near a raw location without a radius
/// query: both sides round coordinates to two decimal places (~1.1 km).
pub fn adjusted_geopoint(point: Geopoint) -> String {
    format!("{:.2},{:.2}", point.lat, point.lng)
}

/// Verdict for one reported location against one venue.
pub fn within_tolerance(reported: Geopoint, venue: Geopoint, accuracy_meters: Option<f64>) -> bool {
    haversine_km(reported, venue) <= tolerance_km(accuracy_meters)
}

/// Path the snapshot's venue dictates for classification.
#[derive(Debug, PartialEq)]
pub enum VenueRoute<'a> {
    /// The activity has no venue at all: straight to reverse geocoding,
    /// never the candidate lookup.
    Missing,
    Populated(Geopoint, &'a str),
    /// A venue without coordinates: resolve via the adjusted-geopoint
    /// bucket first.
    Unpopulated,
}

pub fn venue_route(venue: Option<&Venue>) -> VenueRoute<'_> {
    match venue {
        None => VenueRoute::Missing,
        Some(v) => match v.geopoint {
            Some(point) => VenueRoute::Populated(point, &v.identifier),
            None => VenueRoute::Unpopulated,
        },
    }
}

/// Classify one located event.
///
/// 1. No venue on the snapshot at all: reverse-geocode, distance inaccurate.
/// 2. Venue populated on the snapshot: haversine against it.
/// 3. Venue present but without coordinates: a venue sharing the location's
///    adjusted-geopoint bucket, else reverse-geocode as in 1.
pub async fn classify(
    pool: &PgPool,
    maps: &dyn MapsProvider,
    event: &AddendumEvent,
    reported: Geopoint,
) -> AppResult<GeoClassification> {
    match venue_route(event.activity.venue.as_ref()) {
        VenueRoute::Missing => {
            let place = maps.reverse_geocode(reported).await?;
            return Ok(GeoClassification {
                distance_accurate: false,
                venue_identifier: place.identifier,
                venue_geopoint: None,
            });
        }
        VenueRoute::Populated(point, identifier) => {
            return Ok(GeoClassification {
                distance_accurate: within_tolerance(reported, point, event.accuracy_meters),
                venue_identifier: identifier.to_string(),
                venue_geopoint: Some(point),
            });
        }
        VenueRoute::Unpopulated => {}
    }

    if let Some(candidate) = find_candidate_venue(pool, event.office_id, reported).await? {
        debug!(
            office_id = %event.office_id,
            identifier = %candidate.identifier,
            "classifier matched a venue by adjusted geopoint"
        );
        return Ok(GeoClassification {
            distance_accurate: within_tolerance(reported, candidate.geopoint(), event.accuracy_meters),
            venue_identifier: candidate.identifier.clone(),
            venue_geopoint: Some(candidate.geopoint()),
        });
    }

    let place = maps.reverse_geocode(reported).await?;
    Ok(GeoClassification {
        distance_accurate: false,
        venue_identifier: place.identifier,
        venue_geopoint: None,
    })
}

/// Branch or customer sharing the reported location's bucket key.
async fn find_candidate_venue(
    pool: &PgPool,
    office_id: Uuid,
    reported: Geopoint,
) -> AppResult<Option<VenueRecord>> {
    let venue = sqlx::query_as::<_, VenueRecord>(
        "SELECT identifier, lat, lng, weekly_off, holidays
         FROM venues
         WHERE office_id = $1 AND adjusted_geopoint = $2
         LIMIT 1",
    )
    .bind(office_id)
    .bind(adjusted_geopoint(reported))
    .fetch_optional(pool)
    .await?;
    Ok(venue)
}
