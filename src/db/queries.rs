use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashSet};

use super::models::{CachedDistance, Station, StationWithDistance};
use crate::services::routing::TransportMode;

/// Station columns, qualified with the `s` alias used in joins.
const STATION_COLUMNS: &str = "s.name, s.region, s.base_altitude, s.top_altitude, s.vertical_drop,
     s.total_pistes_km, s.easy_km, s.intermediate_km, s.difficult_km, s.lifts,
     s.longitude, s.latitude, s.url";

/// Insert or replace stations keyed by name. Returns the number of rows written.
pub async fn upsert_stations(pool: &SqlitePool, stations: &[Station]) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut written = 0;

    for station in stations {
        let result = sqlx::query(
            "INSERT INTO stations (
                name, region, base_altitude, top_altitude, vertical_drop,
                total_pistes_km, easy_km, intermediate_km, difficult_km, lifts,
                longitude, latitude, url
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                region = excluded.region,
                base_altitude = excluded.base_altitude,
                top_altitude = excluded.top_altitude,
                vertical_drop = excluded.vertical_drop,
                total_pistes_km = excluded.total_pistes_km,
                easy_km = excluded.easy_km,
                intermediate_km = excluded.intermediate_km,
                difficult_km = excluded.difficult_km,
                lifts = excluded.lifts,
                longitude = excluded.longitude,
                latitude = excluded.latitude,
                url = excluded.url",
        )
        .bind(&station.name)
        .bind(&station.region)
        .bind(station.base_altitude)
        .bind(station.top_altitude)
        .bind(station.vertical_drop)
        .bind(station.total_pistes_km)
        .bind(station.easy_km)
        .bind(station.intermediate_km)
        .bind(station.difficult_km)
        .bind(station.lifts)
        .bind(station.longitude)
        .bind(station.latitude)
        .bind(&station.url)
        .execute(&mut *tx)
        .await?;
        written += result.rows_affected();
    }

    tx.commit().await?;
    Ok(written)
}

/// Whether at least one station has been imported.
pub async fn is_stations_populated(pool: &SqlitePool) -> Result<bool, sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stations")
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// List all stations, ordered by name.
pub async fn list_stations(pool: &SqlitePool) -> Result<Vec<Station>, sqlx::Error> {
    sqlx::query_as::<_, Station>(&format!(
        "SELECT {} FROM stations s ORDER BY s.name",
        STATION_COLUMNS
    ))
    .fetch_all(pool)
    .await
}

/// Exact-key lookup in the distance cache.
pub async fn get_distance(
    pool: &SqlitePool,
    origin: &str,
    destination: &str,
    mode: TransportMode,
) -> Result<Option<CachedDistance>, sqlx::Error> {
    sqlx::query_as::<_, CachedDistance>(
        "SELECT distance_km, duration_minutes, updated_at
         FROM distances
         WHERE origin = ? AND destination = ? AND transport_mode = ?",
    )
    .bind(origin)
    .bind(destination)
    .bind(mode.as_str())
    .fetch_optional(pool)
    .await
}

/// Store a route result, replacing any previous value for the same triple.
pub async fn save_distance(
    pool: &SqlitePool,
    origin: &str,
    destination: &str,
    mode: TransportMode,
    distance_km: f64,
    duration_minutes: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO distances (origin, destination, transport_mode, distance_km, duration_minutes, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (origin, destination, transport_mode) DO UPDATE SET
            distance_km = excluded.distance_km,
            duration_minutes = excluded.duration_minutes,
            updated_at = excluded.updated_at",
    )
    .bind(origin)
    .bind(destination)
    .bind(mode.as_str())
    .bind(distance_km)
    .bind(duration_minutes)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Destinations that already have a cached distance from `origin`.
pub async fn list_destinations_with_distance(
    pool: &SqlitePool,
    origin: &str,
    mode: TransportMode,
) -> Result<HashSet<String>, sqlx::Error> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT destination FROM distances WHERE origin = ? AND transport_mode = ?",
    )
    .bind(origin)
    .bind(mode.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Set the completion flag for one (origin, mode) pair.
///
/// Other modes recorded for the same origin are left untouched.
pub async fn mark_origin_complete(
    pool: &SqlitePool,
    origin: &str,
    mode: TransportMode,
    complete: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO origin_completion (origin, transport_mode, complete, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (origin, transport_mode) DO UPDATE SET
            complete = excluded.complete,
            updated_at = excluded.updated_at",
    )
    .bind(origin)
    .bind(mode.as_str())
    .bind(i64::from(complete))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn is_origin_complete(
    pool: &SqlitePool,
    origin: &str,
    mode: TransportMode,
) -> Result<bool, sqlx::Error> {
    let flag = sqlx::query_scalar::<_, i64>(
        "SELECT complete FROM origin_completion WHERE origin = ? AND transport_mode = ?",
    )
    .bind(origin)
    .bind(mode.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(flag.is_some_and(|f| f != 0))
}

/// The set of modes for which `origin` has been marked complete.
pub async fn calculated_modes(
    pool: &SqlitePool,
    origin: &str,
) -> Result<BTreeSet<TransportMode>, sqlx::Error> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT transport_mode FROM origin_completion WHERE origin = ? AND complete = 1",
    )
    .bind(origin)
    .fetch_all(pool)
    .await?;

    let mut modes = BTreeSet::new();
    for raw in rows {
        match raw.parse::<TransportMode>() {
            Ok(mode) => {
                modes.insert(mode);
            }
            Err(e) => tracing::warn!("Store: skipping completion row for {}: {}", origin, e),
        }
    }
    Ok(modes)
}

/// All stations with a cached distance from `origin`, nearest first.
pub async fn list_stations_with_distances(
    pool: &SqlitePool,
    origin: &str,
    mode: TransportMode,
) -> Result<Vec<StationWithDistance>, sqlx::Error> {
    sqlx::query_as::<_, StationWithDistance>(&format!(
        "SELECT {}, d.distance_km, d.duration_minutes
         FROM stations s
         JOIN distances d ON s.name = d.destination
         WHERE d.origin = ? AND d.transport_mode = ?
         ORDER BY d.distance_km ASC, s.name ASC",
        STATION_COLUMNS
    ))
    .bind(origin)
    .bind(mode.as_str())
    .fetch_all(pool)
    .await
}

/// The `limit` nearest stations from `origin`.
pub async fn closest_stations(
    pool: &SqlitePool,
    origin: &str,
    mode: TransportMode,
    limit: i64,
) -> Result<Vec<StationWithDistance>, sqlx::Error> {
    sqlx::query_as::<_, StationWithDistance>(&format!(
        "SELECT {}, d.distance_km, d.duration_minutes
         FROM stations s
         JOIN distances d ON s.name = d.destination
         WHERE d.origin = ? AND d.transport_mode = ?
         ORDER BY d.distance_km ASC, s.name ASC
         LIMIT ?",
        STATION_COLUMNS
    ))
    .bind(origin)
    .bind(mode.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Stations with a cached distance, largest ski area first, then nearest.
/// `None` returns every row.
pub async fn stations_by_piste_length(
    pool: &SqlitePool,
    origin: &str,
    mode: TransportMode,
    limit: Option<i64>,
) -> Result<Vec<StationWithDistance>, sqlx::Error> {
    sqlx::query_as::<_, StationWithDistance>(&format!(
        "SELECT {}, d.distance_km, d.duration_minutes
         FROM stations s
         JOIN distances d ON s.name = d.destination
         WHERE d.origin = ? AND d.transport_mode = ?
         ORDER BY s.total_pistes_km DESC, d.distance_km ASC
         LIMIT ?",
        STATION_COLUMNS
    ))
    .bind(origin)
    .bind(mode.as_str())
    .bind(limit.unwrap_or(-1))
    .fetch_all(pool)
    .await
}
