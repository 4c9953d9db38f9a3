use rand::Rng;
use std::time::Duration;

/// Spreads a periodic interval by up to `max_fraction` in either direction so that nodes started
///  at the same time do not keep sending their pings in lock step
pub fn jittered(base: Duration, max_fraction: f64) -> Duration {
    if max_fraction <= 0.0 {
        return base;
    }
    let factor = rand::rng().random_range(1.0 - max_fraction..=1.0 + max_fraction);
    base.mul_f64(factor)
}
