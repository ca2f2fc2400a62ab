use std::time::Duration;

use crate::services::retry::RetryPolicy;

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// OpenRouteService API key. Empty when unset; requests will then fail upstream.
    pub ors_api_key: String,
    pub ors_base_url: String,
    pub port: u16,
    /// JSON station catalog used to seed an empty database.
    pub stations_file: String,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_secs: f64,
    pub retry_jitter_factor: f64,
    pub prefetch_max_workers: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/ski_planner.db".to_string()),
            ors_api_key: std::env::var("ORS_API_KEY").unwrap_or_default(),
            ors_base_url: std::env::var("ORS_BASE_URL")
                .unwrap_or_else(|_| "https://api.openrouteservice.org".to_string()),
            port: env_or("PORT", 8080),
            stations_file: std::env::var("STATIONS_FILE")
                .unwrap_or_else(|_| "./data/stations.json".to_string()),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", 3),
            retry_initial_delay_secs: env_or("RETRY_INITIAL_DELAY_SECS", 10.0),
            retry_jitter_factor: env_or("RETRY_JITTER_FACTOR", 0.1),
            prefetch_max_workers: env_or("PREFETCH_MAX_WORKERS", 10),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_secs_f64(self.retry_initial_delay_secs.max(0.0)),
            self.retry_jitter_factor,
        )
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value '{}' for {}", raw, key);
            default
        }),
        Err(_) => default,
    }
}
