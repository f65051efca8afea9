use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{info, warn};

use super::profile::BreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// What the caller is allowed to do after consulting the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed breaker, send as normal.
    Allowed,
    /// The cooldown has elapsed and this caller carries the single half-open probe.
    Probe,
}

/// Why the breaker refused a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub remaining: Duration,
    pub last_error: String,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    open_until: Option<Instant>,
    last_error: Option<String>,
    probe_in_flight: bool,
}

/// Per-host circuit breaker. State lives behind a mutex since concurrent fetches against the
/// same host update the failure counter and race for the half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                open_until: None,
                last_error: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A panic while holding the lock can't leave the counters half-written
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_acquire(&self) -> Result<Admission, Rejection> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<Admission, Rejection> {
        let mut inner = self.lock();
        match inner.state {
            CircuitBreakerState::Closed => Ok(Admission::Allowed),
            CircuitBreakerState::Open => {
                let open_until = inner.open_until.unwrap_or(now);
                if now < open_until {
                    counter!("bioetl_circuit_open_total", "host" => self.name.clone())
                        .increment(1);
                    return Err(Rejection {
                        remaining: open_until - now,
                        last_error: inner.last_error.clone().unwrap_or_default(),
                    });
                }
                inner.state = CircuitBreakerState::HalfOpen;
                inner.probe_in_flight = true;
                info!(
                    host = %self.name,
                    "Circuit breaker transitioning from Open to Half-Open, sending probe"
                );
                Ok(Admission::Probe)
            }
            CircuitBreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Rejection {
                        remaining: Duration::ZERO,
                        last_error: inner.last_error.clone().unwrap_or_default(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Report a successful call. While the breaker is not closed only the half-open probe's
    /// outcome moves it; calls admitted before it tripped are ignored.
    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitBreakerState::Closed, _) => {
                inner.failure_count = 0;
            }
            (CircuitBreakerState::HalfOpen, Admission::Probe) => {
                info!(
                    host = %self.name,
                    "Circuit breaker transitioning from Half-Open to Closed"
                );
                inner.state = CircuitBreakerState::Closed;
                inner.failure_count = 0;
                inner.open_until = None;
                inner.probe_in_flight = false;
            }
            _ => {}
        }
    }

    pub fn record_failure(&self, admission: Admission, cause: impl Into<String>) {
        self.record_failure_at(Instant::now(), admission, cause)
    }

    pub fn record_failure_at(&self, now: Instant, admission: Admission, cause: impl Into<String>) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitBreakerState::Closed, _) => {
                inner.last_error = Some(cause.into());
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.settings.failure_threshold {
                    inner.state = CircuitBreakerState::Open;
                    inner.open_until = Some(now + self.settings.timeout);
                    warn!(
                        host = %self.name,
                        failures = inner.failure_count,
                        "Circuit breaker transitioning from Closed to Open"
                    );
                }
            }
            (CircuitBreakerState::HalfOpen, Admission::Probe) => {
                // A failed probe re-opens with a fresh cooldown
                inner.last_error = Some(cause.into());
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.state = CircuitBreakerState::Open;
                inner.open_until = Some(now + self.settings.timeout);
                inner.probe_in_flight = false;
                warn!(
                    host = %self.name,
                    "Circuit breaker transitioning from Half-Open to Open due to failed probe"
                );
            }
            _ => {}
        }
    }

    /// Give back an admission without judging the host, used when a request never left the
    /// process. Frees the probe slot if `admission` held it.
    pub fn release(&self, admission: Admission) {
        if admission == Admission::Probe {
            self.lock().probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn open_until(&self) -> Option<Instant> {
        self.lock().open_until
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }
}

/// Breakers keyed by destination host, shared by every client talking to that host.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for `host`, creating it with `settings` on first use. Settings of an
    /// existing breaker are not changed.
    pub fn for_host(&self, host: &str, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(host, settings)))
            .clone()
    }

    pub fn get(&self, host: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "api.example.org",
            BreakerSettings {
                failure_threshold: threshold,
                timeout,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(30));
        let now = Instant::now();

        cb.record_failure_at(now, Admission::Allowed, "503");
        cb.record_failure_at(now, Admission::Allowed, "503");
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.try_acquire_at(now), Ok(Admission::Allowed));

        cb.record_failure_at(now, Admission::Allowed, "connection reset");
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert_eq!(cb.open_until(), Some(now + Duration::from_secs(30)));

        let rejection = cb.try_acquire_at(now + Duration::from_secs(10)).unwrap_err();
        assert_eq!(rejection.remaining, Duration::from_secs(20));
        assert_eq!(rejection.last_error, "connection reset");
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = breaker(2, Duration::from_secs(30));
        let now = Instant::now();
        cb.record_failure_at(now, Admission::Allowed, "503");
        cb.record_success(Admission::Allowed);
        cb.record_failure_at(now, Admission::Allowed, "503");
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_exactly_one_probe_after_cooldown() {
        let cb = breaker(1, Duration::from_secs(5));
        let now = Instant::now();
        cb.record_failure_at(now, Admission::Allowed, "503");

        let later = now + Duration::from_secs(5);
        assert_eq!(cb.try_acquire_at(later), Ok(Admission::Probe));
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        // a second caller is refused while the probe is out
        assert!(cb.try_acquire_at(later).is_err());
    }

    #[test]
    fn test_probe_success_closes() {
        let cb = breaker(1, Duration::from_secs(5));
        let now = Instant::now();
        cb.record_failure_at(now, Admission::Allowed, "503");
        let admission = cb.try_acquire_at(now + Duration::from_secs(6)).unwrap();

        cb.record_success(admission);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.try_acquire_at(now), Ok(Admission::Allowed));
    }

    #[test]
    fn test_probe_failure_reopens_with_new_deadline() {
        let cb = breaker(1, Duration::from_secs(5));
        let now = Instant::now();
        cb.record_failure_at(now, Admission::Allowed, "503");

        let probe_time = now + Duration::from_secs(7);
        let admission = cb.try_acquire_at(probe_time).unwrap();
        cb.record_failure_at(probe_time, admission, "timeout");

        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert_eq!(cb.open_until(), Some(probe_time + Duration::from_secs(5)));
        assert!(cb.try_acquire_at(probe_time + Duration::from_secs(1)).is_err());
        assert_eq!(
            cb.try_acquire_at(probe_time + Duration::from_secs(5)),
            Ok(Admission::Probe)
        );
    }

    #[test]
    fn test_half_open_ignores_calls_admitted_while_closed() {
        let cb = breaker(1, Duration::from_secs(5));
        let now = Instant::now();
        // admitted before the trip, still in flight
        let stale = cb.try_acquire_at(now).unwrap();
        assert_eq!(stale, Admission::Allowed);
        cb.record_failure_at(now, Admission::Allowed, "503");

        let later = now + Duration::from_secs(5);
        let fresh = cb.try_acquire_at(later).unwrap();
        assert_eq!(fresh, Admission::Probe);

        cb.record_failure_at(later, stale, "late 503");
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        assert_eq!(cb.last_error().as_deref(), Some("503"));
        assert!(cb.try_acquire_at(later).is_err());

        cb.record_success(stale);
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);

        cb.record_success(fresh);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_released_probe_can_be_taken_again() {
        let cb = breaker(1, Duration::from_secs(1));
        let now = Instant::now();
        cb.record_failure_at(now, Admission::Allowed, "503");
        let later = now + Duration::from_secs(2);
        assert_eq!(cb.try_acquire_at(later), Ok(Admission::Probe));
        cb.release(Admission::Allowed);
        assert!(cb.try_acquire_at(later).is_err());
        cb.release(Admission::Probe);
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        assert_eq!(cb.try_acquire_at(later), Ok(Admission::Probe));
    }

    #[test]
    fn test_registry_shares_breakers_per_host() {
        let registry = CircuitBreakers::new();
        let settings = BreakerSettings {
            failure_threshold: 1,
            timeout: Duration::from_secs(1),
        };
        let a = registry.for_host("a.example.org", settings);
        let a_again = registry.for_host("a.example.org", settings);
        let b = registry.for_host("b.example.org", settings);

        a.record_failure(Admission::Allowed, "boom");
        assert_eq!(a_again.state(), CircuitBreakerState::Open);
        assert_eq!(b.state(), CircuitBreakerState::Closed);
        assert!(registry.get("c.example.org").is_none());
    }
}
