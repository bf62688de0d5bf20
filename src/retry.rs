use crate::config::stack::{JitterMode, RestartBudget};
use rand::Rng;
use std::time::Duration;

const MAX_BACKOFF_EXPONENT: u32 = 16;

/// `base * 2^(attempt - 1)`, capped at `max`. Attempt numbering starts at 1.
pub fn exponential_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 || base.is_zero() {
        return Duration::ZERO;
    }
    let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
    let multiplier = 1u32 << exponent;
    base.checked_mul(multiplier).unwrap_or(max).min(max)
}

pub fn apply_jitter(delay: Duration, mode: JitterMode) -> Duration {
    match mode {
        JitterMode::None => delay,
        JitterMode::Equal => jitter_between(delay / 2, delay),
        JitterMode::Full => jitter_between(Duration::ZERO, delay),
    }
}

/// Delay before restart number `attempt` under `budget`.
pub fn restart_delay(budget: &RestartBudget, attempt: u32) -> Duration {
    let delay = exponential_backoff(budget.base_backoff, budget.max_backoff, attempt);
    apply_jitter(delay, budget.jitter)
}

pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let min_secs = min.as_secs_f64();
    let span = max.as_secs_f64() - min_secs;
    let sample = rng.gen::<f64>() * span + min_secs;
    Duration::from_secs_f64(sample)
}

/// Whole seconds for a `Retry-After` header, rounded up and never zero.
pub fn duration_to_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() == 0 {
        secs.max(1)
    } else {
        secs.saturating_add(1).max(1)
    }
}
