// Ski Planner API v0.1
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use ski_planner::config::AppConfig;
use ski_planner::db;
use ski_planner::routes::{self, distances::AppState};
use ski_planner::services::catalog;
use ski_planner::services::distance::DistanceCacheManager;
use ski_planner::services::ors::OrsClient;
use ski_planner::services::routing::RoutingProvider;

/// Ski Planner API OpenAPI document.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ski Planner API",
        version = "0.1.0",
        description = "Distance cache for ski trip planning. Geocodes a traveller's origin, \
            routes it to every ski station through OpenRouteService with bounded parallelism \
            and retry, and serves the cached distances for recommendation prompts.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Stations", description = "Ski station catalog"),
        (name = "Distances", description = "Cached origin-to-station distances"),
    ),
    paths(
        routes::health::health_check,
        routes::stations::list_stations,
        routes::distances::prefetch_distances,
        routes::distances::get_single_distance,
        routes::distances::list_station_distances,
        routes::distances::get_prefetch_status,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::stations::StationResponse,
            routes::stations::DifficultyBreakdown,
            routes::distances::PrefetchRequest,
            routes::distances::StationOrder,
            routes::distances::StationDistanceResponse,
            routes::distances::PrefetchStatusResponse,
            ski_planner::services::distance::PrefetchSummary,
            ski_planner::services::distance::PrefetchStatus,
            ski_planner::services::distance::DistanceLookup,
            ski_planner::services::routing::TransportMode,
            ski_planner::services::routing::Coordinate,
            ski_planner::errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing; LOG_FORMAT=json switches to structured output
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ski_planner=debug,tower_http=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let config = AppConfig::from_env();

    let pool = db::connect(&config.database_url)
        .await
        .expect("Failed to open database");

    // Seed stations from the JSON catalog on first start
    let populated = db::queries::is_stations_populated(&pool)
        .await
        .expect("Failed to query stations table");
    if populated {
        tracing::info!("Stations table already populated, skipping catalog import");
    } else {
        let catalog_path = Path::new(&config.stations_file);
        match catalog::seed_stations(&pool, catalog_path).await {
            Ok(count) => tracing::info!("Seeded {} stations", count),
            Err(e) => tracing::error!(
                "Failed to seed stations from {}: {}",
                catalog_path.display(),
                e
            ),
        }
    }

    if config.ors_api_key.is_empty() {
        tracing::warn!("ORS_API_KEY is not set; OpenRouteService requests will be rejected");
    }
    let ors_client = OrsClient::new(&config.ors_base_url, &config.ors_api_key)
        .expect("Failed to build OpenRouteService client");
    let provider: Arc<dyn RoutingProvider> = Arc::new(ors_client);

    let manager = DistanceCacheManager::new(
        pool.clone(),
        provider,
        config.retry_policy(),
        config.prefetch_max_workers,
    );
    let app_state = AppState {
        distances: Arc::new(manager),
    };

    // CORS: GET for reads, POST for prefetch
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    // Station and health routes use SqlitePool state directly;
    // distance routes share the cache manager.
    let station_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/stations", get(routes::stations::list_stations))
        .with_state(pool);

    let distance_routes = Router::new()
        .route(
            "/api/v1/distances",
            get(routes::distances::list_station_distances),
        )
        .route(
            "/api/v1/distances/prefetch",
            post(routes::distances::prefetch_distances),
        )
        .route(
            "/api/v1/distances/single",
            get(routes::distances::get_single_distance),
        )
        .route(
            "/api/v1/distances/status",
            get(routes::distances::get_prefetch_status),
        )
        .with_state(app_state);

    let app = Router::new()
        .merge(station_routes)
        .merge(distance_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
