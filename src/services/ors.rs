//! OpenRouteService geocoding and directions client.
//!
//! See: https://openrouteservice.org/dev/#/api-docs
//!
//! Only the fields the distance cache needs are deserialized: the first
//! geocoding feature's coordinates and the first route's summary.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::errors::DistanceError;
use crate::helpers::{metres_to_km_1dp, seconds_to_minutes};
use crate::services::routing::{Coordinate, RouteSummary, RoutingProvider, TransportMode};

/// Per-request timeout. Timeouts count as transient failures.
const ORS_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client for the OpenRouteService geocode and directions APIs.
#[derive(Debug, Clone)]
pub struct OrsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

// --- OpenRouteService JSON response types ---

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    features: Vec<GeocodeFeature>,
}

#[derive(Debug, Deserialize)]
struct GeocodeFeature {
    geometry: GeocodeGeometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeGeometry {
    coordinates: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    summary: DirectionsSummary,
}

/// ORS omits `distance`/`duration` for zero-length routes.
#[derive(Debug, Deserialize)]
struct DirectionsSummary {
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    duration: f64,
}

/// Structured error body, e.g. `{"error": {"code": 2010, "message": "..."}}`.
#[derive(Debug, Deserialize)]
struct OrsErrorPayload {
    error: OrsErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OrsErrorDetail {
    #[serde(default)]
    code: u32,
    message: String,
}

impl OrsClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, DistanceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ORS_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| DistanceError::Permanent(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn fetch_geocode(&self, place: &str) -> Result<Option<Coordinate>, DistanceError> {
        if place.trim().is_empty() {
            return Err(DistanceError::Permanent(
                "Cannot geocode an empty place name".to_string(),
            ));
        }

        let url = format!("{}/geocode/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, &self.api_key)
            .query(&[("text", place), ("size", "1")])
            .send()
            .await
            .map_err(|e| request_error("geocode", e))?;

        let response = ensure_success("geocode", response).await?;
        let body: GeocodeResponse = response.json().await.map_err(|e| {
            DistanceError::Permanent(format!("ORS geocode JSON parse error: {}", e))
        })?;

        let coordinate = body.features.into_iter().next().and_then(|feature| {
            match feature.geometry.coordinates.as_slice() {
                [lon, lat, ..] => Some(Coordinate::new(*lon, *lat)),
                _ => None,
            }
        });

        if coordinate.is_none() {
            tracing::warn!("ORS: could not find coordinates for '{}'", place);
        }
        Ok(coordinate)
    }

    async fn fetch_route(
        &self,
        from: Coordinate,
        to: Coordinate,
        mode: TransportMode,
    ) -> Result<RouteSummary, DistanceError> {
        let url = format!("{}/v2/directions/{}", self.base_url, mode.as_str());
        let body = serde_json::json!({
            "coordinates": [from.to_lon_lat(), to.to_lon_lat()],
        });

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error("directions", e))?;

        let response = ensure_success("directions", response).await?;
        let directions: DirectionsResponse = response.json().await.map_err(|e| {
            DistanceError::Permanent(format!("ORS directions JSON parse error: {}", e))
        })?;

        let route = directions.routes.into_iter().next().ok_or_else(|| {
            DistanceError::Permanent("No routes found in the ORS response".to_string())
        })?;

        Ok(RouteSummary {
            distance_km: metres_to_km_1dp(route.summary.distance),
            duration_minutes: seconds_to_minutes(route.summary.duration),
        })
    }
}

#[async_trait]
impl RoutingProvider for OrsClient {
    async fn geocode(&self, place: &str) -> Result<Option<Coordinate>, DistanceError> {
        self.fetch_geocode(place).await
    }

    async fn route(
        &self,
        from: Coordinate,
        to: Coordinate,
        mode: TransportMode,
    ) -> Result<RouteSummary, DistanceError> {
        self.fetch_route(from, to, mode).await
    }
}

/// Classify a transport-level failure. Builder errors mean the request itself
/// was malformed; everything else (timeouts, connection resets) is transient.
fn request_error(endpoint: &str, err: reqwest::Error) -> DistanceError {
    if err.is_builder() {
        DistanceError::Permanent(format!("ORS {} request invalid: {}", endpoint, err))
    } else {
        DistanceError::TransientService(format!("ORS {} request failed: {}", endpoint, err))
    }
}

/// Pass successful responses through; turn error statuses into
/// `TransientService` (429, 5xx) or `Permanent` (other 4xx).
async fn ensure_success(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, DistanceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<OrsErrorPayload>(&body) {
        Ok(payload) => format!("{} (code {})", payload.error.message, payload.error.code),
        Err(_) if body.is_empty() => "no response body".to_string(),
        Err(_) => body,
    };
    let message = format!("ORS {} returned HTTP {}: {}", endpoint, status, detail);

    if is_transient_status(status) {
        Err(DistanceError::TransientService(message))
    } else {
        Err(DistanceError::Permanent(message))
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
