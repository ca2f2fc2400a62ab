use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::services::routing::Coordinate;

/// A ski station, keyed by its unique name.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Station {
    pub name: String,
    pub region: String,
    pub base_altitude: i64,
    pub top_altitude: i64,
    pub vertical_drop: i64,
    pub total_pistes_km: f64,
    pub easy_km: f64,
    pub intermediate_km: f64,
    pub difficult_km: f64,
    pub lifts: Option<i64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    /// External reference page for the station.
    pub url: Option<String>,
}

impl Station {
    /// The station's position, if both axes are known.
    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.longitude, self.latitude) {
            (Some(lon), Some(lat)) => Some(Coordinate::new(lon, lat)),
            _ => None,
        }
    }
}

/// A cached route result for an (origin, destination, mode) triple.
#[derive(Debug, Clone, FromRow)]
pub struct CachedDistance {
    pub distance_km: f64,
    pub duration_minutes: i64,
    pub updated_at: DateTime<Utc>,
}

/// A station joined with its cached distance from one origin.
#[derive(Debug, Clone, FromRow)]
pub struct StationWithDistance {
    #[sqlx(flatten)]
    pub station: Station,
    pub distance_km: f64,
    pub duration_minutes: i64,
}
