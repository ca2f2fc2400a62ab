//! Station catalog import.
//!
//! Reads the station list from a JSON document of the form:
//!
//! ```json
//! { "stations": [ {
//!     "name": "Verbier", "region": "Valais",
//!     "base_altitude": 1500, "top_altitude": 3330, "vertical_drop": 1830,
//!     "total_pistes_km": 410,
//!     "difficulty_breakdown": { "easy_km": 100, "intermediate_km": 200, "difficult_km": 110 },
//!     "lifts": 67, "coordinates": [7.2286, 46.0961], "url": "https://..."
//! } ] }
//! ```
//!
//! Missing numeric fields default to zero; `coordinates` is `[lon, lat]` or null.
//! Rows with an empty name are skipped and malformed coordinates are dropped,
//! both with a warning, so one bad row never blocks the import.

use serde::Deserialize;
use sqlx::SqlitePool;
use std::path::Path;
use thiserror::Error;

use crate::db::models::Station;
use crate::db::queries;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error reading station catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    stations: Vec<CatalogStation>,
}

#[derive(Debug, Deserialize)]
struct CatalogStation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    base_altitude: i64,
    #[serde(default)]
    top_altitude: i64,
    #[serde(default)]
    vertical_drop: i64,
    #[serde(default)]
    total_pistes_km: f64,
    #[serde(default)]
    difficulty_breakdown: DifficultyBreakdown,
    lifts: Option<i64>,
    #[serde(default)]
    coordinates: Option<serde_json::Value>,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DifficultyBreakdown {
    #[serde(default)]
    easy_km: f64,
    #[serde(default)]
    intermediate_km: f64,
    #[serde(default)]
    difficult_km: f64,
}

impl CatalogStation {
    /// Convert a catalog row. Rows without a name are dropped; unusable
    /// coordinates are cleared so the station is kept but never routed.
    fn into_station(self) -> Option<Station> {
        if self.name.trim().is_empty() {
            tracing::warn!("Catalog: skipping station with empty name");
            return None;
        }

        let (longitude, latitude) = match self.coordinates.as_ref().map(lon_lat) {
            None => (None, None),
            Some(Some((lon, lat))) => (Some(lon), Some(lat)),
            Some(None) => {
                tracing::warn!(
                    "Catalog: {} has invalid coordinates {}, expected [lon, lat]",
                    self.name,
                    self.coordinates.as_ref().map(ToString::to_string).unwrap_or_default()
                );
                (None, None)
            }
        };

        Some(Station {
            name: self.name,
            region: self.region,
            base_altitude: self.base_altitude,
            top_altitude: self.top_altitude,
            vertical_drop: self.vertical_drop,
            total_pistes_km: self.total_pistes_km,
            easy_km: self.difficulty_breakdown.easy_km,
            intermediate_km: self.difficulty_breakdown.intermediate_km,
            difficult_km: self.difficulty_breakdown.difficult_km,
            lifts: self.lifts,
            longitude,
            latitude,
            url: self.url,
        })
    }
}

/// `[lon, lat]` within WGS84 bounds, or `None` for any other shape.
fn lon_lat(value: &serde_json::Value) -> Option<(f64, f64)> {
    match value.as_array()?.as_slice() {
        [lon, lat] => {
            let (lon, lat) = (lon.as_f64()?, lat.as_f64()?);
            ((-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat)).then_some((lon, lat))
        }
        _ => None,
    }
}

/// Parse a catalog document.
pub fn parse_catalog(content: &str) -> Result<Vec<Station>, CatalogError> {
    let file: CatalogFile = serde_json::from_str(content)?;
    Ok(file
        .stations
        .into_iter()
        .filter_map(CatalogStation::into_station)
        .collect())
}

/// Read and parse a catalog file.
pub fn load_catalog(path: &Path) -> Result<Vec<Station>, CatalogError> {
    let content = std::fs::read_to_string(path)?;
    parse_catalog(&content)
}

/// Import a catalog file into the store. Returns the number of stations written.
pub async fn seed_stations(pool: &SqlitePool, path: &Path) -> Result<u64, CatalogError> {
    let stations = load_catalog(path)?;
    if stations.is_empty() {
        tracing::warn!("Catalog: no stations in {}", path.display());
        return Ok(0);
    }

    let without_coordinates = stations.iter().filter(|s| s.coordinate().is_none()).count();
    let written = queries::upsert_stations(pool, &stations).await?;

    tracing::info!(
        "Catalog: imported {} stations from {} ({} without coordinates)",
        written,
        path.display(),
        without_coordinates
    );
    Ok(written)
}
