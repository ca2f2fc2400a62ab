//! Geocoding and routing capability used by the distance cache.
//!
//! The cache only needs two things from a provider: a coordinate for a place
//! name, and a distance/duration for a coordinate pair under a transport mode.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::errors::DistanceError;

/// A WGS84 position in GeoJSON axis order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinate {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// `[lon, lat]`, the order routing APIs expect.
    pub fn to_lon_lat(self) -> [f64; 2] {
        [self.longitude, self.latitude]
    }
}

/// Travel method partitioning the distance cache.
///
/// Serialized as the routing profile name (e.g. `driving-car`).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    #[default]
    DrivingCar,
    DrivingHgv,
    CyclingRegular,
    FootWalking,
    PublicTransport,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::DrivingCar => "driving-car",
            TransportMode::DrivingHgv => "driving-hgv",
            TransportMode::CyclingRegular => "cycling-regular",
            TransportMode::FootWalking => "foot-walking",
            TransportMode::PublicTransport => "public-transport",
        }
    }

    /// Map a user-facing preference label ("Car", "Public Transport") to a mode.
    pub fn from_preference(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("car") {
            TransportMode::DrivingCar
        } else {
            TransportMode::PublicTransport
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = DistanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "driving-car" => Ok(TransportMode::DrivingCar),
            "driving-hgv" => Ok(TransportMode::DrivingHgv),
            "cycling-regular" => Ok(TransportMode::CyclingRegular),
            "foot-walking" => Ok(TransportMode::FootWalking),
            "public-transport" => Ok(TransportMode::PublicTransport),
            other => Err(DistanceError::Permanent(format!(
                "Unknown transport mode '{}'",
                other
            ))),
        }
    }
}

/// Normalized route result: kilometres (1 decimal) and whole minutes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct RouteSummary {
    pub distance_km: f64,
    pub duration_minutes: i64,
}

/// External geocoder/router.
///
/// `geocode` returns `Ok(None)` when the place has no match; errors are
/// reserved for transport and upstream failures.
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn geocode(&self, place: &str) -> Result<Option<Coordinate>, DistanceError>;

    async fn route(
        &self,
        from: Coordinate,
        to: Coordinate,
        mode: TransportMode,
    ) -> Result<RouteSummary, DistanceError>;
}

/// Lets the HTTP layer hold a provider as `Arc<dyn RoutingProvider>`.
#[async_trait]
impl<T: RoutingProvider + ?Sized> RoutingProvider for Arc<T> {
    async fn geocode(&self, place: &str) -> Result<Option<Coordinate>, DistanceError> {
        (**self).geocode(place).await
    }

    async fn route(
        &self,
        from: Coordinate,
        to: Coordinate,
        mode: TransportMode,
    ) -> Result<RouteSummary, DistanceError> {
        (**self).route(from, to, mode).await
    }
}
