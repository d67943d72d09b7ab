//! Time arithmetic shared by the limiter and the meter.

use std::time::Duration;

use tokio::time::Instant;

/// Truncate `elapsed` down to the nearest multiple of `resolution`.
#[inline]
pub(crate) fn truncate(elapsed: Duration, resolution: Duration) -> Duration {
    let res = resolution.as_nanos();
    if res == 0 {
        return elapsed;
    }
    let slots = elapsed.as_nanos() / res;
    nanos_to_duration(slots * res)
}

/// Seconds from `earlier` to `later`, negative when `later` precedes `earlier`.
#[inline]
pub(crate) fn signed_secs(later: Instant, earlier: Instant) -> f64 {
    if later >= earlier {
        later.duration_since(earlier).as_secs_f64()
    } else {
        -earlier.duration_since(later).as_secs_f64()
    }
}

/// Convert a non-negative number of seconds into a duration, saturating.
#[inline]
pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[inline]
fn nanos_to_duration(nanos: u128) -> Duration {
    let secs = (nanos / 1_000_000_000) as u64;
    let sub = (nanos % 1_000_000_000) as u32;
    Duration::new(secs, sub)
}
