//! Distance cache endpoints: prefetch, single lookups, listings and status.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use utoipa::{IntoParams, ToSchema};

use crate::db::models;
use crate::errors::{AppError, ErrorResponse};
use crate::routes::stations::StationResponse;
use crate::services::distance::{DistanceCacheManager, DistanceLookup, PrefetchSummary};
use crate::services::routing::{RoutingProvider, TransportMode};

/// Largest `limit` accepted by the listing endpoint.
const MAX_LIST_LIMIT: i64 = 500;

/// Distance cache manager over a type-erased routing provider.
pub type SharedDistanceManager = Arc<DistanceCacheManager<Arc<dyn RoutingProvider>>>;

#[derive(Clone)]
pub struct AppState {
    pub distances: SharedDistanceManager,
}

// --- Request / query types ---

#[derive(Debug, Deserialize, ToSchema)]
pub struct PrefetchRequest {
    /// Free-text origin (e.g. "Geneva, Switzerland")
    pub origin: String,
    #[serde(default)]
    pub transport_mode: TransportMode,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StationOrder {
    /// Nearest first
    #[default]
    Distance,
    /// Largest ski area first
    Pistes,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DistanceListQuery {
    /// Origin the distances were prefetched from
    pub origin: String,
    #[serde(default)]
    pub transport_mode: TransportMode,
    #[serde(default)]
    pub order: StationOrder,
    /// Maximum number of stations to return
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SingleDistanceQuery {
    pub origin: String,
    pub destination: String,
    #[serde(default)]
    pub transport_mode: TransportMode,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatusQuery {
    pub origin: String,
    #[serde(default)]
    pub transport_mode: TransportMode,
}

// --- Response types ---

/// A station with its cached distance from the requested origin.
#[derive(Debug, Serialize, ToSchema)]
pub struct StationDistanceResponse {
    #[serde(flatten)]
    pub station: StationResponse,
    pub distance_km: f64,
    pub duration_minutes: i64,
}

impl From<models::StationWithDistance> for StationDistanceResponse {
    fn from(row: models::StationWithDistance) -> Self {
        Self {
            station: StationResponse::from(row.station),
            distance_km: row.distance_km,
            duration_minutes: row.duration_minutes,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PrefetchStatusResponse {
    pub origin: String,
    pub transport_mode: TransportMode,
    /// Whether a prefetch pass for this mode finished with progress
    pub complete: bool,
    /// Every mode marked complete for this origin
    pub calculated_modes: Vec<TransportMode>,
}

fn require_non_empty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

// --- Handlers ---

/// Compute and cache distances from an origin to every station.
///
/// Always answers 200 with a summary; failures are reported in `status`
/// and `error`. Runs on its own task and is cancelled if the client
/// disconnects.
#[utoipa::path(
    post,
    path = "/api/v1/distances/prefetch",
    tag = "Distances",
    request_body = PrefetchRequest,
    responses(
        (status = 200, description = "Prefetch summary", body = PrefetchSummary),
        (status = 400, description = "Empty origin", body = ErrorResponse),
    )
)]
pub async fn prefetch_distances(
    State(state): State<AppState>,
    Json(request): Json<PrefetchRequest>,
) -> Result<Json<PrefetchSummary>, AppError> {
    require_non_empty("origin", &request.origin)?;
    let origin = request.origin.trim().to_string();

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let manager = state.distances.clone();
    let mode = request.transport_mode;
    let task = tokio::spawn(async move { manager.prefetch_all(&origin, mode, &cancel).await });

    let summary = task
        .await
        .map_err(|e| AppError::InternalError(format!("Prefetch task failed: {}", e)))?;
    Ok(Json(summary))
}

/// Distance between two places, served from the cache when possible.
#[utoipa::path(
    get,
    path = "/api/v1/distances/single",
    tag = "Distances",
    params(SingleDistanceQuery),
    responses(
        (status = 200, description = "Distance lookup; failures are reported in `error`", body = DistanceLookup),
        (status = 400, description = "Empty origin or destination", body = ErrorResponse),
    )
)]
pub async fn get_single_distance(
    State(state): State<AppState>,
    Query(params): Query<SingleDistanceQuery>,
) -> Result<Json<DistanceLookup>, AppError> {
    require_non_empty("origin", &params.origin)?;
    require_non_empty("destination", &params.destination)?;

    let lookup = state
        .distances
        .calculate_distance(
            params.origin.trim(),
            params.destination.trim(),
            params.transport_mode,
        )
        .await;
    Ok(Json(lookup))
}

/// Stations with a cached distance from an origin.
#[utoipa::path(
    get,
    path = "/api/v1/distances",
    tag = "Distances",
    params(DistanceListQuery),
    responses(
        (status = 200, description = "Stations with distances", body = Vec<StationDistanceResponse>),
        (status = 400, description = "Invalid query", body = ErrorResponse),
    )
)]
pub async fn list_station_distances(
    State(state): State<AppState>,
    Query(params): Query<DistanceListQuery>,
) -> Result<Json<Vec<StationDistanceResponse>>, AppError> {
    require_non_empty("origin", &params.origin)?;
    if let Some(limit) = params.limit {
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(AppError::BadRequest(format!(
                "limit must be between 1 and {}",
                MAX_LIST_LIMIT
            )));
        }
    }

    let origin = params.origin.trim();
    let mode = params.transport_mode;
    let rows = match (params.order, params.limit) {
        (StationOrder::Distance, None) => {
            state.distances.stations_with_distances(origin, mode).await?
        }
        (StationOrder::Distance, Some(limit)) => {
            state.distances.closest_stations(origin, mode, limit).await?
        }
        (StationOrder::Pistes, limit) => {
            state
                .distances
                .stations_by_piste_length(origin, mode, limit)
                .await?
        }
    };

    let items: Vec<StationDistanceResponse> = rows
        .into_iter()
        .map(StationDistanceResponse::from)
        .collect();
    Ok(Json(items))
}

/// Whether an origin has been fully prefetched.
#[utoipa::path(
    get,
    path = "/api/v1/distances/status",
    tag = "Distances",
    params(StatusQuery),
    responses(
        (status = 200, description = "Completion status", body = PrefetchStatusResponse),
        (status = 400, description = "Empty origin", body = ErrorResponse),
    )
)]
pub async fn get_prefetch_status(
    State(state): State<AppState>,
    Query(params): Query<StatusQuery>,
) -> Result<Json<PrefetchStatusResponse>, AppError> {
    require_non_empty("origin", &params.origin)?;
    let origin = params.origin.trim();

    let complete = state
        .distances
        .is_origin_complete(origin, params.transport_mode)
        .await?;
    let calculated_modes = state.distances.calculated_modes(origin).await?;

    Ok(Json(PrefetchStatusResponse {
        origin: origin.to_string(),
        transport_mode: params.transport_mode,
        complete,
        calculated_modes: calculated_modes.into_iter().collect(),
    }))
}
