//! Pure ramp-curve math used by the token-release loop.

use std::time::Duration;

/// The semaphore implementation uses 3 bits of usize for flags.
/// Any value greater than this will be capped to avoid crashing
/// the whole thing.
pub const MAX_TOKENS: usize = usize::MAX >> 3;

/// Cumulative number of permits owed `elapsed` after the run started.
///
/// The rate climbs linearly from zero to `throughput` over `ramp_up` and then
/// stays flat, so the cumulative count is the integral of that rate: a
/// parabola during ramp-up followed by a straight line.
///
/// ```text
/// t <= ramp:  owed = throughput * t² / (2 * ramp)
/// t >  ramp:  owed = throughput * ramp / 2 + throughput * (t - ramp)
/// ramp == 0:  owed = throughput * t
/// ```
pub fn owed_permits(elapsed: Duration, ramp_up: Duration, throughput: f64) -> f64 {
    if throughput.is_nan() || throughput <= 0.0 {
        return 0.0;
    }
    let t = elapsed.as_secs_f64();
    let ramp = ramp_up.as_secs_f64();

    if ramp == 0.0 {
        throughput * t
    } else if t <= ramp {
        throughput * t * t / (2.0 * ramp)
    } else {
        throughput * ramp / 2.0 + throughput * (t - ramp)
    }
}

/// Number of whole permits to release now, given what is owed and what has
/// already been released.
///
/// Only whole permits leave the loop. Whatever is left over stays owed and is
/// picked up by a later tick, so low rates (e.g. 0.3/s) still converge.
/// At most `cap` permits are released in one go.
///
/// Returns `(permits_to_release, carried_fraction)`.
pub fn tokens_due(owed: f64, released: u64, cap: u64) -> (u64, f64) {
    let backlog = owed - released as f64;
    if backlog.is_nan() || backlog < 1.0 {
        return (0, backlog.max(0.0));
    }

    let whole = backlog.floor();
    // Saturate instead of wrapping when the curve runs off the end of u64.
    let due = if whole >= u64::MAX as f64 {
        u64::MAX
    } else {
        whole as u64
    };
    let due = due.min(cap);
    (due, backlog - due as f64)
}
