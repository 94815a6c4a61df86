use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Throttle for the sweep trigger.
///
/// Injected through `AppState` instead of living as a process-wide
/// singleton. State is a single time-refilled quota bucket, so memory stays
/// constant regardless of how often the trigger fires.
pub struct SweepThrottle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl SweepThrottle {
    pub fn new(requests: u32, per_seconds: u64) -> Self {
        let quota = Quota::with_period(Duration::from_secs(per_seconds))
            .unwrap()
            .allow_burst(NonZeroU32::new(requests).unwrap());

        SweepThrottle {
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn check(&self) -> AppResult<()> {
        self.limiter.check().map_err(|_| AppError::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_limited() {
        let throttle = SweepThrottle::new(2, 60);
        assert!(throttle.check().is_ok());
        assert!(throttle.check().is_ok());
        assert!(matches!(throttle.check(), Err(AppError::RateLimited)));
    }
}
