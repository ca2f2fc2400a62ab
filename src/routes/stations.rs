use axum::extract::State;
use axum::Json;
use serde::Serialize;
use sqlx::SqlitePool;
use utoipa::ToSchema;

use crate::db::{models, queries};
use crate::errors::AppError;
use crate::services::routing::Coordinate;

/// Kilometres of piste per difficulty class.
#[derive(Debug, Serialize, ToSchema)]
pub struct DifficultyBreakdown {
    pub easy_km: f64,
    pub intermediate_km: f64,
    pub difficult_km: f64,
}

/// Response type for a ski station.
#[derive(Debug, Serialize, ToSchema)]
pub struct StationResponse {
    /// Unique station name (e.g. "Verbier")
    pub name: String,
    /// Region or canton
    pub region: String,
    /// Altitude of the resort base in metres
    pub base_altitude: i64,
    /// Highest lift-served point in metres
    pub top_altitude: i64,
    pub vertical_drop: i64,
    /// Total marked pistes in kilometres
    pub total_pistes_km: f64,
    pub difficulty_breakdown: DifficultyBreakdown,
    pub lifts: Option<i64>,
    /// Position, absent when the catalog has none (such stations are never routed)
    pub coordinates: Option<Coordinate>,
    pub url: Option<String>,
}

impl From<models::Station> for StationResponse {
    fn from(s: models::Station) -> Self {
        Self {
            coordinates: s.coordinate(),
            name: s.name,
            region: s.region,
            base_altitude: s.base_altitude,
            top_altitude: s.top_altitude,
            vertical_drop: s.vertical_drop,
            total_pistes_km: s.total_pistes_km,
            difficulty_breakdown: DifficultyBreakdown {
                easy_km: s.easy_km,
                intermediate_km: s.intermediate_km,
                difficult_km: s.difficult_km,
            },
            lifts: s.lifts,
            url: s.url,
        }
    }
}

/// List all stations in the catalog.
#[utoipa::path(
    get,
    path = "/api/v1/stations",
    tag = "Stations",
    responses(
        (status = 200, description = "All stations, ordered by name", body = Vec<StationResponse>),
    )
)]
pub async fn list_stations(
    State(pool): State<SqlitePool>,
) -> Result<Json<Vec<StationResponse>>, AppError> {
    let stations = queries::list_stations(&pool).await?;
    let items: Vec<StationResponse> = stations.into_iter().map(StationResponse::from).collect();
    Ok(Json(items))
}
