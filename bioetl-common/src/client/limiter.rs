use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::profile::RateLimit;

/// Token bucket for one destination host, built on governor's GCRA limiter.
///
/// Waiting is cooperative: `acquire` parks the task on a timer until the bucket has a cell,
/// it never spins.
pub struct HostRateLimiter {
    host: String,
    limit: RateLimit,
    limiter: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for HostRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRateLimiter")
            .field("host", &self.host)
            .field("limit", &self.limit)
            .finish()
    }
}

impl HostRateLimiter {
    pub fn new(host: impl Into<String>, limit: RateLimit) -> Result<Self, String> {
        let burst = NonZeroU32::new(limit.max_calls)
            .ok_or_else(|| "rate limit must allow at least one call".to_string())?;
        let quota = Quota::with_period(limit.interval())
            .ok_or_else(|| format!("invalid rate limit period {:?}", limit.period))?
            .allow_burst(burst);

        Ok(Self {
            host: host.into(),
            limit,
            limiter: RateLimiter::direct(quota),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn limit(&self) -> &RateLimit {
        &self.limit
    }

    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Non-blocking variant, true when a token was taken.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Limiters keyed by destination host. The first profile to touch a host decides its quota.
#[derive(Debug, Default)]
pub struct RateLimiters {
    limiters: Mutex<HashMap<String, Arc<HostRateLimiter>>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_host(&self, host: &str, limit: &RateLimit) -> Result<Arc<HostRateLimiter>, String> {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = limiters.get(host) {
            return Ok(existing.clone());
        }
        let limiter = Arc::new(HostRateLimiter::new(host, limit.clone())?);
        limiters.insert(host.to_string(), limiter.clone());
        Ok(limiter)
    }
}

/// Seeded jitter source, owned by a single client instance so that the sequence of delays is
/// reproducible no matter how tasks are scheduled.
#[derive(Debug)]
pub struct Jitter {
    max: Duration,
    rng: Option<Mutex<StdRng>>,
}

impl Jitter {
    pub fn new(limit: &RateLimit) -> Self {
        Self {
            max: limit.interval(),
            rng: limit
                .jitter
                .then(|| Mutex::new(StdRng::seed_from_u64(limit.jitter_seed))),
        }
    }

    pub fn disabled() -> Self {
        Self {
            max: Duration::ZERO,
            rng: None,
        }
    }

    /// Next uniform delay in `[0, max)`, zero when jitter is off.
    pub fn next_delay(&self) -> Duration {
        let Some(rng) = &self.rng else {
            return Duration::ZERO;
        };
        let max_nanos = u64::try_from(self.max.as_nanos()).unwrap_or(u64::MAX);
        if max_nanos == 0 {
            return Duration::ZERO;
        }
        let mut rng = rng.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_nanos(rng.gen_range(0..max_nanos))
    }
}
