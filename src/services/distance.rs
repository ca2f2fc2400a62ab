//! Distance cache manager.
//!
//! Answers "how far is station X from origin O by mode M" from the store,
//! computing and persisting missing pairs through a [`RoutingProvider`].
//!
//! Bulk prefetch for one (origin, mode):
//! - Skips entirely when the pair is already marked complete
//! - Only dispatches destinations without a cached row, so an interrupted run
//!   resumes where it stopped
//! - Geocodes the origin once, then routes destinations on a bounded set of
//!   concurrent tasks (`buffer_unordered`)
//! - Per-destination failures are tallied and never abort siblings
//! - Marks the pair complete only when the pass made progress

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::db::models::{CachedDistance, StationWithDistance};
use crate::db::queries;
use crate::errors::DistanceError;
use crate::services::retry::RetryPolicy;
use crate::services::routing::{Coordinate, RouteSummary, RoutingProvider, TransportMode};

/// Default number of destinations routed concurrently.
pub const DEFAULT_MAX_WORKERS: usize = 10;

// --- Result types ---

/// Outcome of a single-pair distance query. Failures are reported in `error`.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DistanceLookup {
    pub start: String,
    pub destination: String,
    pub distance_km: Option<f64>,
    pub duration_minutes: Option<i64>,
    /// True when the value came from the store without any network call.
    pub cached: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchStatus {
    AlreadyCalculated,
    Completed,
    Failed,
    Cancelled,
}

/// Summary of one bulk prefetch pass.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PrefetchSummary {
    pub status: PrefetchStatus,
    pub origin: String,
    pub transport_mode: TransportMode,
    /// Stations with coordinates, cached or not.
    pub total_destinations: usize,
    pub already_cached: usize,
    pub newly_calculated: usize,
    pub failed: usize,
    pub skipped_without_coordinates: usize,
    pub error: Option<String>,
}

impl PrefetchSummary {
    fn new(origin: &str, mode: TransportMode, status: PrefetchStatus) -> Self {
        Self {
            status,
            origin: origin.to_string(),
            transport_mode: mode,
            total_destinations: 0,
            already_cached: 0,
            newly_calculated: 0,
            failed: 0,
            skipped_without_coordinates: 0,
            error: None,
        }
    }

    fn with_error(mut self, status: PrefetchStatus, error: impl ToString) -> Self {
        self.status = status;
        self.error = Some(error.to_string());
        self
    }
}

/// A station still missing a distance from the current origin.
#[derive(Debug, Clone)]
struct PendingDestination {
    name: String,
    coordinate: Coordinate,
}

// --- Manager ---

/// Owns the store handle, routing provider and retry policy.
///
/// Construct once and share via `Arc`.
pub struct DistanceCacheManager<P> {
    pool: SqlitePool,
    provider: P,
    retry: RetryPolicy,
    max_workers: usize,
}

impl<P: RoutingProvider> DistanceCacheManager<P> {
    pub fn new(pool: SqlitePool, provider: P, retry: RetryPolicy, max_workers: usize) -> Self {
        Self {
            pool,
            provider,
            retry,
            max_workers: max_workers.max(1),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn is_origin_complete(
        &self,
        origin: &str,
        mode: TransportMode,
    ) -> Result<bool, DistanceError> {
        Ok(queries::is_origin_complete(&self.pool, origin, mode).await?)
    }

    pub async fn calculated_modes(
        &self,
        origin: &str,
    ) -> Result<BTreeSet<TransportMode>, DistanceError> {
        Ok(queries::calculated_modes(&self.pool, origin).await?)
    }

    pub async fn cached_distance(
        &self,
        origin: &str,
        destination: &str,
        mode: TransportMode,
    ) -> Result<Option<CachedDistance>, DistanceError> {
        Ok(queries::get_distance(&self.pool, origin, destination, mode).await?)
    }

    // --- Single pair ---

    /// Distance between two place names, from the cache when possible.
    pub async fn calculate_distance(
        &self,
        origin: &str,
        destination: &str,
        mode: TransportMode,
    ) -> DistanceLookup {
        let mut lookup = DistanceLookup {
            start: origin.to_string(),
            destination: destination.to_string(),
            distance_km: None,
            duration_minutes: None,
            cached: false,
            error: None,
        };

        match self.lookup_or_compute(origin, destination, mode).await {
            Ok((route, cached)) => {
                lookup.distance_km = Some(route.distance_km);
                lookup.duration_minutes = Some(route.duration_minutes);
                lookup.cached = cached;
            }
            Err(e) => {
                tracing::warn!(
                    "Distance: {} -> {} ({}) failed: {}",
                    origin,
                    destination,
                    mode,
                    e
                );
                lookup.error = Some(e.to_string());
            }
        }

        lookup
    }

    async fn lookup_or_compute(
        &self,
        origin: &str,
        destination: &str,
        mode: TransportMode,
    ) -> Result<(RouteSummary, bool), DistanceError> {
        if let Some(hit) = queries::get_distance(&self.pool, origin, destination, mode).await? {
            tracing::debug!("Distance: cache hit {} -> {} ({})", origin, destination, mode);
            let route = RouteSummary {
                distance_km: hit.distance_km,
                duration_minutes: hit.duration_minutes,
            };
            return Ok((route, true));
        }

        let from = self.geocode_required(origin).await?;
        let to = self.geocode_required(destination).await?;

        let provider = &self.provider;
        let label = format!("route {} -> {}", origin, destination);
        let route = self
            .retry
            .run(&label, move || provider.route(from, to, mode))
            .await?;

        queries::save_distance(
            &self.pool,
            origin,
            destination,
            mode,
            route.distance_km,
            route.duration_minutes,
        )
        .await?;

        Ok((route, false))
    }

    async fn geocode_required(&self, place: &str) -> Result<Coordinate, DistanceError> {
        let provider = &self.provider;
        let label = format!("geocode {}", place);
        self.retry
            .run(&label, move || provider.geocode(place))
            .await?
            .ok_or_else(|| DistanceError::NotFound(format!("Could not geocode '{}'", place)))
    }

    // --- Bulk prefetch ---

    /// Compute and store the distance from `origin` to every station.
    ///
    /// Never returns an error: failures are reported through the summary's
    /// `status` and `error` fields.
    pub async fn prefetch_all(
        &self,
        origin: &str,
        mode: TransportMode,
        cancel: &CancellationToken,
    ) -> PrefetchSummary {
        match self.run_prefetch(origin, mode, cancel).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("Prefetch: {} ({}) aborted: {}", origin, mode, e);
                PrefetchSummary::new(origin, mode, PrefetchStatus::Failed)
                    .with_error(PrefetchStatus::Failed, e)
            }
        }
    }

    async fn run_prefetch(
        &self,
        origin: &str,
        mode: TransportMode,
        cancel: &CancellationToken,
    ) -> Result<PrefetchSummary, DistanceError> {
        // 1. Already done for this pair?
        if queries::is_origin_complete(&self.pool, origin, mode).await? {
            tracing::info!("Prefetch: {} ({}) already calculated", origin, mode);
            return Ok(PrefetchSummary::new(
                origin,
                mode,
                PrefetchStatus::AlreadyCalculated,
            ));
        }

        // 2. Work out what is still missing
        let stations = queries::list_stations(&self.pool).await?;
        let cached = queries::list_destinations_with_distance(&self.pool, origin, mode).await?;

        let mut summary = PrefetchSummary::new(origin, mode, PrefetchStatus::Completed);
        let mut to_fetch = Vec::new();

        for station in stations {
            let Some(coordinate) = station.coordinate() else {
                tracing::warn!("Prefetch: skipping {} (no coordinates)", station.name);
                summary.skipped_without_coordinates += 1;
                continue;
            };
            summary.total_destinations += 1;
            if cached.contains(&station.name) {
                summary.already_cached += 1;
            } else {
                to_fetch.push(PendingDestination {
                    name: station.name,
                    coordinate,
                });
            }
        }

        tracing::info!(
            "Prefetch: {} ({}): {} destinations, {} cached, {} to fetch",
            origin,
            mode,
            summary.total_destinations,
            summary.already_cached,
            to_fetch.len()
        );

        if to_fetch.is_empty() {
            return Ok(summary);
        }

        // 3. Origin coordinate is needed by every unit of work
        let origin_coordinate = match self.geocode_origin(origin, cancel).await {
            Ok(coordinate) => coordinate,
            Err(DistanceError::Cancelled) => {
                tracing::info!("Prefetch: {} ({}) cancelled before dispatch", origin, mode);
                return Ok(summary.with_error(PrefetchStatus::Cancelled, DistanceError::Cancelled));
            }
            Err(e) => {
                tracing::error!("Prefetch: failed to geocode origin {}: {}", origin, e);
                return Ok(summary.with_error(PrefetchStatus::Failed, e));
            }
        };

        // 4. Fan out, bounded
        let width = self.max_workers.min(to_fetch.len());
        let mut outcomes = stream::iter(to_fetch)
            .map(|target| self.fetch_destination(origin, origin_coordinate, target, mode, cancel))
            .buffer_unordered(width);

        let mut interrupted = 0;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(()) => summary.newly_calculated += 1,
                Err(DistanceError::Cancelled) => interrupted += 1,
                Err(_) => summary.failed += 1,
            }
        }

        if cancel.is_cancelled() {
            tracing::warn!(
                "Prefetch: {} ({}) cancelled: {} calculated, {} failed, {} not finished",
                origin,
                mode,
                summary.newly_calculated,
                summary.failed,
                interrupted
            );
            return Ok(summary.with_error(PrefetchStatus::Cancelled, DistanceError::Cancelled));
        }

        // 5. Mark complete only when this pass made progress
        if summary.newly_calculated > 0 {
            if let Err(e) = queries::mark_origin_complete(&self.pool, origin, mode, true).await {
                tracing::error!(
                    "Prefetch: {} ({}) could not be marked complete: {}",
                    origin,
                    mode,
                    e
                );
                return Ok(summary.with_error(PrefetchStatus::Failed, DistanceError::from(e)));
            }
        } else {
            tracing::warn!(
                "Prefetch: {} ({}) calculated nothing, leaving it incomplete",
                origin,
                mode
            );
        }

        tracing::info!(
            "Prefetch: {} ({}) done: {} new, {} failed",
            origin,
            mode,
            summary.newly_calculated,
            summary.failed
        );

        Ok(summary)
    }

    async fn geocode_origin(
        &self,
        origin: &str,
        cancel: &CancellationToken,
    ) -> Result<Coordinate, DistanceError> {
        let provider = &self.provider;
        let label = format!("geocode {}", origin);
        self.retry
            .run_until_cancelled(&label, cancel, move || provider.geocode(origin))
            .await?
            .ok_or_else(|| DistanceError::NotFound(format!("Could not geocode origin '{}'", origin)))
    }

    /// One unit of work: route with retries, then persist.
    async fn fetch_destination(
        &self,
        origin: &str,
        origin_coordinate: Coordinate,
        target: PendingDestination,
        mode: TransportMode,
        cancel: &CancellationToken,
    ) -> Result<(), DistanceError> {
        let provider = &self.provider;
        let pool = &self.pool;
        let destination = target.name.as_str();
        let to = target.coordinate;
        let label = format!("route {} -> {}", origin, destination);

        let result = self
            .retry
            .run_until_cancelled(&label, cancel, move || async move {
                let route = provider.route(origin_coordinate, to, mode).await?;
                queries::save_distance(
                    pool,
                    origin,
                    destination,
                    mode,
                    route.distance_km,
                    route.duration_minutes,
                )
                .await?;
                Ok::<_, DistanceError>(route)
            })
            .await;

        match result {
            Ok(route) => {
                tracing::debug!(
                    "Prefetch: {} -> {}: {} km, {} min",
                    origin,
                    destination,
                    route.distance_km,
                    route.duration_minutes
                );
                Ok(())
            }
            Err(DistanceError::Cancelled) => Err(DistanceError::Cancelled),
            Err(e) => {
                tracing::error!("Prefetch: {} -> {} failed: {}", origin, destination, e);
                Err(e)
            }
        }
    }

    // --- Read side ---

    pub async fn stations_with_distances(
        &self,
        origin: &str,
        mode: TransportMode,
    ) -> Result<Vec<StationWithDistance>, DistanceError> {
        Ok(queries::list_stations_with_distances(&self.pool, origin, mode).await?)
    }

    pub async fn closest_stations(
        &self,
        origin: &str,
        mode: TransportMode,
        limit: i64,
    ) -> Result<Vec<StationWithDistance>, DistanceError> {
        Ok(queries::closest_stations(&self.pool, origin, mode, limit).await?)
    }

    pub async fn stations_by_piste_length(
        &self,
        origin: &str,
        mode: TransportMode,
        limit: Option<i64>,
    ) -> Result<Vec<StationWithDistance>, DistanceError> {
        Ok(queries::stations_by_piste_length(&self.pool, origin, mode, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::db::models::Station;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const GENEVA: &str = "Geneva, Switzerland";

    /// Deterministic provider: known places geocode, routes are 10 km per
    /// degree of longitude, and selected destination longitudes fail.
    #[derive(Default)]
    struct StubProvider {
        places: HashMap<String, Coordinate>,
        permanent_failures: Vec<f64>,
        transient_failures: AtomicUsize,
        geocode_calls: Arc<AtomicUsize>,
        route_calls: Arc<AtomicUsize>,
    }

    impl StubProvider {
        fn with_geneva() -> Self {
            let mut places = HashMap::new();
            places.insert(GENEVA.to_string(), Coordinate::new(6.0, 46.2));
            Self {
                places,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RoutingProvider for StubProvider {
        async fn geocode(&self, place: &str) -> Result<Option<Coordinate>, DistanceError> {
            self.geocode_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.places.get(place).copied())
        }

        async fn route(
            &self,
            from: Coordinate,
            to: Coordinate,
            _mode: TransportMode,
        ) -> Result<RouteSummary, DistanceError> {
            self.route_calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent_failures.contains(&to.longitude) {
                return Err(DistanceError::Permanent("HTTP 404".to_string()));
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DistanceError::TransientService("HTTP 429".to_string()));
            }
            let km = ((to.longitude - from.longitude).abs() * 100.0).round() / 10.0;
            Ok(RouteSummary {
                distance_km: km,
                duration_minutes: km as i64,
            })
        }
    }

    fn station(name: &str, longitude: Option<f64>) -> Station {
        Station {
            name: name.to_string(),
            region: "Valais".to_string(),
            base_altitude: 1500,
            top_altitude: 3000,
            vertical_drop: 1500,
            total_pistes_km: 100.0,
            easy_km: 30.0,
            intermediate_km: 50.0,
            difficult_km: 20.0,
            lifts: None,
            longitude,
            latitude: longitude.map(|_| 46.0),
            url: None,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), 0.0)
    }

    async fn manager_with(
        provider: StubProvider,
        stations: &[Station],
    ) -> DistanceCacheManager<StubProvider> {
        let pool = memory_pool().await;
        queries::upsert_stations(&pool, stations).await.unwrap();
        DistanceCacheManager::new(pool, provider, fast_retry(), DEFAULT_MAX_WORKERS)
    }

    fn five_stations() -> Vec<Station> {
        (1..=5)
            .map(|i| station(&format!("Station {}", i), Some(6.0 + i as f64)))
            .collect()
    }

    #[tokio::test]
    async fn test_end_to_end_prefetch_from_geneva() {
        let provider = StubProvider::with_geneva();
        let geocodes = provider.geocode_calls.clone();
        let routes = provider.route_calls.clone();
        let stations = vec![
            station("Verbier", Some(7.2)),
            station("Champéry", Some(6.8)),
            station("Zermatt", Some(7.7)),
            station("Nowhere", None),
        ];
        let manager = manager_with(provider, &stations).await;

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.status, PrefetchStatus::Completed);
        assert_eq!(summary.total_destinations, 3);
        assert_eq!(summary.already_cached, 0);
        assert_eq!(summary.newly_calculated, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped_without_coordinates, 1);
        assert!(summary.error.is_none());
        assert_eq!(geocodes.load(Ordering::SeqCst), 1);
        assert_eq!(routes.load(Ordering::SeqCst), 3);

        let rows = manager
            .stations_with_distances(GENEVA, TransportMode::DrivingCar)
            .await
            .unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.station.name.as_str()).collect();
        assert_eq!(names, vec!["Champéry", "Verbier", "Zermatt"]);
        assert_eq!(rows[0].distance_km, 8.0);

        assert!(manager
            .is_origin_complete(GENEVA, TransportMode::DrivingCar)
            .await
            .unwrap());
        assert!(!manager
            .is_origin_complete(GENEVA, TransportMode::FootWalking)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_second_prefetch_is_already_calculated_without_network() {
        let provider = StubProvider::with_geneva();
        let geocodes = provider.geocode_calls.clone();
        let routes = provider.route_calls.clone();
        let manager = manager_with(provider, &five_stations()).await;
        let cancel = CancellationToken::new();

        let first = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &cancel)
            .await;
        assert_eq!(first.status, PrefetchStatus::Completed);
        let geocodes_after_first = geocodes.load(Ordering::SeqCst);
        let routes_after_first = routes.load(Ordering::SeqCst);

        let second = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &cancel)
            .await;
        assert_eq!(second.status, PrefetchStatus::AlreadyCalculated);
        assert_eq!(second.newly_calculated, 0);
        assert_eq!(geocodes.load(Ordering::SeqCst), geocodes_after_first);
        assert_eq!(routes.load(Ordering::SeqCst), routes_after_first);
    }

    #[tokio::test]
    async fn test_prefetch_resumes_from_partial_cache() {
        let provider = StubProvider::with_geneva();
        let routes = provider.route_calls.clone();
        let manager = manager_with(provider, &five_stations()).await;

        for name in ["Station 1", "Station 2"] {
            queries::save_distance(manager.pool(), GENEVA, name, TransportMode::DrivingCar, 5.0, 6)
                .await
                .unwrap();
        }

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.status, PrefetchStatus::Completed);
        assert_eq!(summary.total_destinations, 5);
        assert_eq!(summary.already_cached, 2);
        assert_eq!(summary.newly_calculated, 3);
        assert_eq!(routes.load(Ordering::SeqCst), 3);

        // Pre-seeded rows are not recomputed.
        let kept = manager
            .cached_distance(GENEVA, "Station 1", TransportMode::DrivingCar)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.distance_km, 5.0);
    }

    #[tokio::test]
    async fn test_fully_cached_origin_completes_without_geocoding() {
        let provider = StubProvider::with_geneva();
        let geocodes = provider.geocode_calls.clone();
        let manager = manager_with(provider, &five_stations()).await;

        for i in 1..=5 {
            let name = format!("Station {}", i);
            queries::save_distance(manager.pool(), GENEVA, &name, TransportMode::DrivingCar, 1.0, 1)
                .await
                .unwrap();
        }

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.status, PrefetchStatus::Completed);
        assert_eq!(summary.already_cached, 5);
        assert_eq!(summary.newly_calculated, 0);
        assert_eq!(geocodes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_failing_destination_does_not_abort_batch() {
        let mut provider = StubProvider::with_geneva();
        provider.permanent_failures = vec![9.0]; // Station 3
        let manager = manager_with(provider, &five_stations()).await;

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.status, PrefetchStatus::Completed);
        assert_eq!(summary.newly_calculated, 4);
        assert_eq!(summary.failed, 1);
        assert!(manager
            .is_origin_complete(GENEVA, TransportMode::DrivingCar)
            .await
            .unwrap());
        assert!(manager
            .cached_distance(GENEVA, "Station 3", TransportMode::DrivingCar)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_transient_route_failures_are_retried() {
        let provider = StubProvider::with_geneva();
        provider.transient_failures.store(2, Ordering::SeqCst);
        let routes = provider.route_calls.clone();
        let manager = manager_with(provider, &[station("Verbier", Some(7.2))]).await;

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.newly_calculated, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(routes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_all_destinations_failing_leaves_origin_incomplete() {
        let mut provider = StubProvider::with_geneva();
        provider.permanent_failures = vec![7.0, 8.0, 9.0, 10.0, 11.0];
        let manager = manager_with(provider, &five_stations()).await;

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.status, PrefetchStatus::Completed);
        assert_eq!(summary.newly_calculated, 0);
        assert_eq!(summary.failed, 5);
        assert!(!manager
            .is_origin_complete(GENEVA, TransportMode::DrivingCar)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_origin_fails_without_writes() {
        let provider = StubProvider::default();
        let routes = provider.route_calls.clone();
        let manager = manager_with(provider, &five_stations()).await;

        let summary = manager
            .prefetch_all("Atlantis", TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.status, PrefetchStatus::Failed);
        assert!(summary.error.unwrap().contains("Atlantis"));
        assert_eq!(routes.load(Ordering::SeqCst), 0);
        assert!(manager
            .stations_with_distances("Atlantis", TransportMode::DrivingCar)
            .await
            .unwrap()
            .is_empty());
        assert!(!manager
            .is_origin_complete("Atlantis", TransportMode::DrivingCar)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_prefetch_marks_nothing() {
        let provider = StubProvider::with_geneva();
        let routes = provider.route_calls.clone();
        let manager = manager_with(provider, &five_stations()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &cancel)
            .await;

        assert_eq!(summary.status, PrefetchStatus::Cancelled);
        assert_eq!(summary.newly_calculated, 0);
        assert_eq!(routes.load(Ordering::SeqCst), 0);
        assert!(!manager
            .is_origin_complete(GENEVA, TransportMode::DrivingCar)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_width_one_still_processes_every_destination() {
        let provider = StubProvider::with_geneva();
        let pool = memory_pool().await;
        queries::upsert_stations(&pool, &five_stations()).await.unwrap();
        let manager = DistanceCacheManager::new(pool, provider, fast_retry(), 1);

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::CyclingRegular, &CancellationToken::new())
            .await;

        assert_eq!(summary.newly_calculated, 5);
        let closest = manager
            .closest_stations(GENEVA, TransportMode::CyclingRegular, 2)
            .await
            .unwrap();
        let names: Vec<&str> = closest.iter().map(|r| r.station.name.as_str()).collect();
        assert_eq!(names, vec!["Station 1", "Station 2"]);
    }

    /// Geocodes everything to Geneva; each route holds for a short real
    /// delay and records how many routes were in flight at once. Routes to
    /// `stuck_longitude` always fail transiently.
    #[derive(Default)]
    struct SlowProvider {
        in_flight: AtomicUsize,
        peak: Arc<AtomicUsize>,
        stuck_longitude: Option<f64>,
        stuck_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RoutingProvider for SlowProvider {
        async fn geocode(&self, _place: &str) -> Result<Option<Coordinate>, DistanceError> {
            Ok(Some(Coordinate::new(6.0, 46.2)))
        }

        async fn route(
            &self,
            _from: Coordinate,
            to: Coordinate,
            _mode: TransportMode,
        ) -> Result<RouteSummary, DistanceError> {
            if self.stuck_longitude == Some(to.longitude) {
                self.stuck_calls.fetch_add(1, Ordering::SeqCst);
                return Err(DistanceError::TransientService("HTTP 503".to_string()));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RouteSummary {
                distance_km: 50.0,
                duration_minutes: 40,
            })
        }
    }

    fn spread_stations(count: usize) -> Vec<Station> {
        (0..count)
            .map(|i| station(&format!("Resort {:02}", i), Some(7.0 + i as f64 / 100.0)))
            .collect()
    }

    #[tokio::test]
    async fn test_in_flight_routes_never_exceed_max_workers() {
        let provider = SlowProvider::default();
        let peak = provider.peak.clone();
        let pool = memory_pool().await;
        queries::upsert_stations(&pool, &spread_stations(25)).await.unwrap();
        let manager = DistanceCacheManager::new(pool, provider, fast_retry(), DEFAULT_MAX_WORKERS);

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.status, PrefetchStatus::Completed);
        assert_eq!(summary.newly_calculated, 25);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= DEFAULT_MAX_WORKERS, "peak in flight was {}", peak);
        assert!(peak > 1, "routes ran one at a time");
    }

    #[tokio::test]
    async fn test_in_flight_routes_capped_by_batch_size() {
        let provider = SlowProvider::default();
        let peak = provider.peak.clone();
        let pool = memory_pool().await;
        queries::upsert_stations(&pool, &spread_stations(3)).await.unwrap();
        let manager = DistanceCacheManager::new(pool, provider, fast_retry(), DEFAULT_MAX_WORKERS);

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.newly_calculated, 3);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_backoff_of_one_destination_does_not_hold_back_siblings() {
        let stations = spread_stations(5);
        let stuck = stations[2].longitude;
        let provider = SlowProvider {
            stuck_longitude: stuck,
            ..Default::default()
        };
        let stuck_calls = provider.stuck_calls.clone();
        let pool = memory_pool().await;
        queries::upsert_stations(&pool, &stations).await.unwrap();
        // One retry after a minute: the stuck unit sits in its backoff sleep.
        let retry = RetryPolicy::new(2, Duration::from_secs(60), 0.0);
        let manager = DistanceCacheManager::new(pool, provider, retry, DEFAULT_MAX_WORKERS);
        let mode = TransportMode::DrivingCar;
        let cancel = CancellationToken::new();

        let watcher = async {
            loop {
                let saved = manager.stations_with_distances(GENEVA, mode).await.unwrap();
                if saved.len() == 4 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };

        let (summary, ()) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(manager.prefetch_all(GENEVA, mode, &cancel), watcher) },
        )
        .await
        .expect("siblings finished while one destination was backing off");

        assert_eq!(summary.status, PrefetchStatus::Cancelled);
        assert_eq!(summary.newly_calculated, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(stuck_calls.load(Ordering::SeqCst), 1);
        assert!(manager
            .cached_distance(GENEVA, "Resort 02", mode)
            .await
            .unwrap()
            .is_none());
        assert!(!manager.is_origin_complete(GENEVA, mode).await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_write_failure_keeps_counts() {
        let manager = manager_with(StubProvider::with_geneva(), &five_stations()).await;
        sqlx::query(
            "CREATE TRIGGER block_completion BEFORE INSERT ON origin_completion
             BEGIN SELECT RAISE(ABORT, 'completion writes disabled'); END",
        )
        .execute(manager.pool())
        .await
        .unwrap();

        let summary = manager
            .prefetch_all(GENEVA, TransportMode::DrivingCar, &CancellationToken::new())
            .await;

        assert_eq!(summary.status, PrefetchStatus::Failed);
        assert_eq!(summary.total_destinations, 5);
        assert_eq!(summary.newly_calculated, 5);
        assert_eq!(summary.failed, 0);
        assert!(summary
            .error
            .unwrap()
            .contains("completion writes disabled"));
        assert_eq!(
            manager
                .stations_with_distances(GENEVA, TransportMode::DrivingCar)
                .await
                .unwrap()
                .len(),
            5
        );
    }

    #[tokio::test]
    async fn test_calculate_distance_miss_then_hit() {
        let mut provider = StubProvider::with_geneva();
        provider
            .places
            .insert("Verbier".to_string(), Coordinate::new(7.2, 46.1));
        let routes = provider.route_calls.clone();
        let manager = manager_with(provider, &[]).await;

        let first = manager
            .calculate_distance(GENEVA, "Verbier", TransportMode::DrivingCar)
            .await;
        assert_eq!(first.distance_km, Some(12.0));
        assert_eq!(first.duration_minutes, Some(12));
        assert!(!first.cached);
        assert!(first.error.is_none());

        let second = manager
            .calculate_distance(GENEVA, "Verbier", TransportMode::DrivingCar)
            .await;
        assert!(second.cached);
        assert_eq!(second.distance_km, Some(12.0));
        assert_eq!(routes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_calculate_distance_reports_unknown_place() {
        let manager = manager_with(StubProvider::with_geneva(), &[]).await;

        let lookup = manager
            .calculate_distance(GENEVA, "Atlantis", TransportMode::DrivingCar)
            .await;

        assert_eq!(lookup.start, GENEVA);
        assert_eq!(lookup.destination, "Atlantis");
        assert!(lookup.distance_km.is_none());
        assert!(!lookup.cached);
        assert!(lookup.error.unwrap().contains("Atlantis"));
    }

    #[test]
    fn test_prefetch_status_serializes_snake_case() {
        let json = serde_json::to_value(PrefetchStatus::AlreadyCalculated).unwrap();
        assert_eq!(json, "already_calculated");
    }
}
