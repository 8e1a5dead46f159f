// src/services/maps.rs
//
// External maps collaborator: reverse geocoding and distance-matrix lookups.
// Consumed behind a trait so the aggregation passes can run against a mock.

use crate::{config::Config, errors::AppError};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::sync::Arc;

use crate::models::Geopoint;

/// Human-readable label for a raw location: the locality when geocoding
/// resolves one, else the full formatted address.
#[derive(Debug, Clone)]
pub struct PlaceSummary {
    pub identifier: String,
}

#[async_trait]
pub trait MapsProvider: Send + Sync {
    async fn reverse_geocode(&self, point: Geopoint) -> Result<PlaceSummary, AppError>;

    /// Best-known travelled distance between two points, in km. `None` when
    /// the service knows no route between them.
    async fn travelled_distance_km(
        &self,
        from: Geopoint,
        to: Geopoint,
    ) -> Result<Option<Decimal>, AppError>;
}

#[derive(Clone)]
pub struct GoogleMapsClient {
    client: Client,
    config: Arc<Config>,
}

// ─── Geocoding API ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    #[serde(rename = "formatted_address")]
    formatted_address: String,
    #[serde(rename = "address_components", default)]
    address_components: Vec<AddressComponent>,
}

#[derive(Debug, Deserialize)]
struct AddressComponent {
    #[serde(rename = "long_name")]
    long_name: String,
    #[serde(default)]
    types: Vec<String>,
}

// ─── Distance Matrix API ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DistanceMatrixResponse {
    status: String,
    #[serde(default)]
    rows: Vec<DistanceMatrixRow>,
}

#[derive(Debug, Deserialize)]
struct DistanceMatrixRow {
    #[serde(default)]
    elements: Vec<DistanceMatrixElement>,
}

#[derive(Debug, Deserialize)]
struct DistanceMatrixElement {
    status: String,
    distance: Option<DistanceValue>,
}

#[derive(Debug, Deserialize)]
struct DistanceValue {
    /// Meters.
    value: i64,
}

impl GoogleMapsClient {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn latlng(point: Geopoint) -> String {
        format!("{},{}", point.lat, point.lng)
    }
}

#[async_trait]
impl MapsProvider for GoogleMapsClient {
    async fn reverse_geocode(&self, point: Geopoint) -> Result<PlaceSummary, AppError> {
        let url = format!("{}/maps/api/geocode/json", self.config.maps_base_url);
        let resp: GeocodeResponse = self
            .client
            .get(&url)
            .query(&[
                ("latlng", Self::latlng(point)),
                ("key", self.config.maps_api_key.clone()),
            ])
            .send()
            .await
            .map_err(|e| AppError::Geocoding(e.to_string()))?
            .json()
            .await
            .map_err(|e| AppError::Geocoding(e.to_string()))?;

        if resp.status != "OK" {
            return Err(AppError::Geocoding(format!(
                "geocode returned status {}",
                resp.status
            )));
        }

        let first = resp
            .results
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Geocoding("geocode returned no results".to_string()))?;

        let locality = first
            .address_components
            .iter()
            .find(|c| c.types.iter().any(|t| t == "sublocality" || t == "locality"))
            .map(|c| c.long_name.clone());

        Ok(PlaceSummary {
            identifier: locality.unwrap_or(first.formatted_address),
        })
    }

    async fn travelled_distance_km(
        &self,
        from: Geopoint,
        to: Geopoint,
    ) -> Result<Option<Decimal>, AppError> {
        let url = format!("{}/maps/api/distancematrix/json", self.config.maps_base_url);
        let resp: DistanceMatrixResponse = self
            .client
            .get(&url)
            .query(&[
                ("origins", Self::latlng(from)),
                ("destinations", Self::latlng(to)),
                ("key", self.config.maps_api_key.clone()),
            ])
            .send()
            .await
            .map_err(|e| AppError::DistanceMatrix(e.to_string()))?
            .json()
            .await
            .map_err(|e| AppError::DistanceMatrix(e.to_string()))?;

        if resp.status != "OK" {
            return Err(AppError::DistanceMatrix(format!(
                "distance matrix returned status {}",
                resp.status
            )));
        }

        let element = resp
            .rows
            .into_iter()
            .next()
            .and_then(|r| r.elements.into_iter().next());

        // "ZERO_RESULTS" on the element means no known route.
        let meters = match element {
            Some(el) if el.status == "OK" => el.distance.map(|d| d.value),
            _ => None,
        };

        Ok(meters.and_then(|m| {
            Decimal::from_f64(m as f64 / 1000.0).map(|d| d.round_dp(3))
        }))
    }
}
