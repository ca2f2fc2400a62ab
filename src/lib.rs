//! Ski trip planner core.
//!
//! Caches resort distances from a traveller's origin, prefetching every
//! station in parallel against OpenRouteService with retry and backoff, and
//! reduces the plan agent's streaming events into renderable state.

pub mod config;
pub mod db;
pub mod errors;
mod helpers;
pub mod routes;
pub mod services;
