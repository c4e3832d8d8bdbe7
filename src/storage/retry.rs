//! Retry classification and backoff schedule for the Storage Retry Controller.
//!
//! Grounded on the reference backend's SQLite error strings (constraint
//! violations, missing-table/column errors surfaced by sqlx) and its
//! `rate_limiter`-style jittered backoff; generalized here into a classifier
//! + a fixed geometric delay schedule.

use rand::Rng;
use std::time::Duration;

/// Non-retryable substrings. `"no such column"` is handled
/// specially by the caller (the utm_source degradation path), so it is
/// intentionally excluded from this generic list.
const NON_RETRYABLE_SUBSTRINGS: &[&str] = &[
    "SQLITE_CONSTRAINT",
    "constraint failed",
    "no such table",
    "has no column named",
    "syntax error",
    "wrong number of arguments",
    "malformed",
    "schema",
];

pub fn is_utm_column_missing(message: &str) -> bool {
    message.contains("no such column: utm_source")
}

pub fn is_retryable(message: &str) -> bool {
    if is_utm_column_missing(message) {
        return false;
    }
    !NON_RETRYABLE_SUBSTRINGS
        .iter()
        .any(|needle| message.contains(needle))
}

pub const MAX_ATTEMPTS: u32 = 6;

/// Canonical geometric delay sequence (ms) used by the reference backend's
/// jittered backoff: ~100, ~140, ~480, ~480, ... A fixed base sequence
/// exists so tests can assert exact attempt counts without depending on
/// wall-clock timing; jitter is applied multiplicatively on top.
const BASE_DELAYS_MS: &[u64] = &[100, 140, 480, 480, 480, 480];

/// Deterministic in tests: callers inject the jitter fraction instead of
/// reading `rand::thread_rng()` directly from pure logic.
pub fn backoff_delay(attempt: u32, jitter_fraction: f64) -> Duration {
    let idx = (attempt as usize).min(BASE_DELAYS_MS.len() - 1);
    let base = BASE_DELAYS_MS[idx] as f64;
    let delay = base * (1.0 + jitter_fraction);
    Duration::from_millis(delay.round() as u64)
}

pub fn random_jitter_fraction() -> f64 {
    rand::thread_rng().gen_range(0.0..0.2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_constraint_violations_as_non_retryable() {
        assert!(!is_retryable("SQLITE_CONSTRAINT: UNIQUE violation"));
        assert!(!is_retryable("no such table: users"));
        assert!(!is_retryable("has no column named foo"));
    }

    #[test]
    fn classifies_transient_errors_as_retryable() {
        assert!(is_retryable("database is locked"));
        assert!(is_retryable("connection reset by peer"));
    }

    #[test]
    fn utm_column_missing_is_not_generically_retryable() {
        assert!(!is_retryable("no such column: utm_source"));
        assert!(is_utm_column_missing("no such column: utm_source"));
    }

    #[test]
    fn backoff_delay_follows_canonical_sequence_with_zero_jitter() {
        assert_eq!(backoff_delay(0, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, 0.0), Duration::from_millis(140));
        assert_eq!(backoff_delay(2, 0.0), Duration::from_millis(480));
        assert_eq!(backoff_delay(10, 0.0), Duration::from_millis(480));
    }
}
