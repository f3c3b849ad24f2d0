//! Renewal scheduling.

use std::time::Duration;
use time::OffsetDateTime;

/// Shortest interval between Certify attempts.
pub const MIN_REFRESH: Duration = Duration::from_secs(1);
/// Longest interval between Certify attempts.
pub const MAX_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);

/// Milliseconds of delay per remaining second of validity (0.8).
const REFRESH_MILLIS_PER_SEC: u64 = 800;

/// Returns how long to wait before renewing a certificate expiring at
/// `not_after`: 80% of the remaining whole seconds, clamped to
/// [`MIN_REFRESH`]..=[`MAX_REFRESH`].
pub fn refresh_interval(not_after: OffsetDateTime, now: OffsetDateTime) -> Duration {
    let remaining = (not_after - now).whole_seconds();
    if remaining <= 0 {
        return MIN_REFRESH;
    }
    let millis = (remaining as u64).saturating_mul(REFRESH_MILLIS_PER_SEC);
    Duration::from_millis(millis).clamp(MIN_REFRESH, MAX_REFRESH)
}
