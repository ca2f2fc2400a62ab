//! Unit conversions for routing responses.
//!
//! Routing providers answer in metres and seconds; the distance cache stores
//! kilometres rounded to 1 decimal place and whole minutes.
//!
//! Both conversions return 0 for non-finite or negative inputs (NaN, ±Inf),
//! since a cached distance is never negative.

/// Convert metres to kilometres, rounded to 1 decimal place.
pub(crate) fn metres_to_km_1dp(metres: f64) -> f64 {
    if !metres.is_finite() || metres < 0.0 {
        tracing::warn!(
            "metres_to_km_1dp received invalid value {}, defaulting to 0",
            metres
        );
        return 0.0;
    }
    (metres / 100.0).round() / 10.0
}

/// Convert seconds to minutes, rounded to the nearest whole minute.
pub(crate) fn seconds_to_minutes(seconds: f64) -> i64 {
    if !seconds.is_finite() || seconds < 0.0 {
        tracing::warn!(
            "seconds_to_minutes received invalid value {}, defaulting to 0",
            seconds
        );
        return 0;
    }
    (seconds / 60.0).round() as i64
}
