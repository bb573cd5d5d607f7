//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Base delay after the first consecutive accept failure.
pub const ACCEPT_BACKOFF_BASE_MS: u64 = 5;

/// Upper bound on the accept backoff.
pub const ACCEPT_BACKOFF_MAX_MS: u64 = 1000;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Delay before retrying `accept` after `consecutive_failures` errors in a row.
pub fn accept_backoff(consecutive_failures: u32) -> Duration {
    calculate_backoff(
        consecutive_failures,
        ACCEPT_BACKOFF_BASE_MS,
        ACCEPT_BACKOFF_MAX_MS,
    )
}
