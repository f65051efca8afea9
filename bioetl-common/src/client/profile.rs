use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// Timeout tiers for a single request. `connect` must not exceed `total`; whatever is left of
/// the total budget after connecting is available for reading unless `read` says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Option<Duration>,
    pub total: Duration,
}

impl Timeouts {
    pub fn read_budget(&self) -> Duration {
        match self.read {
            Some(read) => read.min(self.total),
            None => self.total.saturating_sub(self.connect),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    pub max_calls: u32,
    pub period: Duration,
    pub jitter: bool,
    pub jitter_seed: u64,
}

impl RateLimit {
    /// The spacing between calls when the bucket is drained, also the upper bound on jitter.
    pub fn interval(&self) -> Duration {
        self.period / self.max_calls.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

/// A fully resolved, immutable request profile. Build one with [`RequestProfile::resolve`]
/// or start from [`RequestProfile::default`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestProfile {
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimit,
    pub breaker: BreakerSettings,
    pub pool: PoolLimits,
    pub headers: BTreeMap<String, String>,
}

impl Default for RequestProfile {
    fn default() -> Self {
        Self {
            timeouts: Timeouts {
                connect: Duration::from_secs(10),
                read: None,
                total: Duration::from_secs(60),
            },
            retry: RetryPolicy::default(),
            rate_limit: RateLimit {
                max_calls: 10,
                period: Duration::from_secs(1),
                jitter: true,
                jitter_seed: 0,
            },
            breaker: BreakerSettings {
                failure_threshold: 5,
                timeout: Duration::from_secs(60),
            },
            pool: PoolLimits {
                max_idle_per_host: 10,
                idle_timeout: Duration::from_secs(90),
            },
            headers: BTreeMap::from([
                ("Accept".to_string(), "application/json".to_string()),
                (
                    "User-Agent".to_string(),
                    concat!("bioetl/", env!("CARGO_PKG_VERSION")).to_string(),
                ),
            ]),
        }
    }
}

/// Partially specified profile, as found in configuration. Every field is optional so
/// that source-specific, named and global layers can be stacked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileOverrides {
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub total_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub backoff_cap_ms: Option<u64>,
    pub retryable_statuses: Option<Vec<u16>>,
    pub retryable_methods: Option<Vec<String>>,
    pub rate_limit_calls: Option<u32>,
    pub rate_limit_period_ms: Option<u64>,
    pub jitter: Option<bool>,
    pub jitter_seed: Option<u64>,
    pub breaker_failure_threshold: Option<u32>,
    pub breaker_timeout_ms: Option<u64>,
    pub pool_max_idle_per_host: Option<usize>,
    pub pool_idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

macro_rules! take_first {
    ($self:ident, $lower:ident, $($field:ident),+ $(,)?) => {
        $( $self.$field = $self.$field.take().or_else(|| $lower.$field.clone()); )+
    };
}

impl ProfileOverrides {
    /// Layer `self` over `lower`: fields set on `self` win, unset fields fall through.
    /// Headers are merged key by key with the same precedence.
    pub fn over(mut self, lower: &ProfileOverrides) -> ProfileOverrides {
        take_first!(
            self,
            lower,
            connect_timeout_ms,
            read_timeout_ms,
            total_timeout_ms,
            max_attempts,
            backoff_base_ms,
            backoff_multiplier,
            backoff_cap_ms,
            retryable_statuses,
            retryable_methods,
            rate_limit_calls,
            rate_limit_period_ms,
            jitter,
            jitter_seed,
            breaker_failure_threshold,
            breaker_timeout_ms,
            pool_max_idle_per_host,
            pool_idle_timeout_ms,
        );
        for (name, value) in &lower.headers {
            self.headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }
}

impl RequestProfile {
    /// Resolve a profile for one source: source-specific fields win, then the named profile,
    /// then the global layer, then the built-in defaults.
    pub fn resolve(
        global: &ProfileOverrides,
        named: Option<&ProfileOverrides>,
        source: &ProfileOverrides,
    ) -> Result<RequestProfile, String> {
        let mut merged = source.clone();
        if let Some(named) = named {
            merged = merged.over(named);
        }
        merged = merged.over(global);
        RequestProfile::default().apply(&merged)
    }

    /// Apply a set of overrides to this profile, producing a new validated profile.
    pub fn apply(&self, o: &ProfileOverrides) -> Result<RequestProfile, String> {
        let ms = Duration::from_millis;
        let mut profile = self.clone();

        if let Some(v) = o.connect_timeout_ms {
            profile.timeouts.connect = ms(v);
        }
        if let Some(v) = o.read_timeout_ms {
            profile.timeouts.read = Some(ms(v));
        }
        if let Some(v) = o.total_timeout_ms {
            profile.timeouts.total = ms(v);
        }
        if let Some(v) = o.max_attempts {
            profile.retry.max_attempts = v;
        }
        if let Some(v) = o.backoff_base_ms {
            profile.retry.base_delay = ms(v);
        }
        if let Some(v) = o.backoff_multiplier {
            profile.retry.multiplier = v;
        }
        if let Some(v) = o.backoff_cap_ms {
            profile.retry.max_delay = ms(v);
        }
        if let Some(v) = &o.retryable_statuses {
            profile.retry.retryable_statuses = v.iter().copied().collect();
        }
        if let Some(v) = &o.retryable_methods {
            profile.retry.retryable_methods = v
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|_| format!("'{m}' is not a valid HTTP method"))
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = o.rate_limit_calls {
            profile.rate_limit.max_calls = v;
        }
        if let Some(v) = o.rate_limit_period_ms {
            profile.rate_limit.period = ms(v);
        }
        if let Some(v) = o.jitter {
            profile.rate_limit.jitter = v;
        }
        if let Some(v) = o.jitter_seed {
            profile.rate_limit.jitter_seed = v;
        }
        if let Some(v) = o.breaker_failure_threshold {
            profile.breaker.failure_threshold = v;
        }
        if let Some(v) = o.breaker_timeout_ms {
            profile.breaker.timeout = ms(v);
        }
        if let Some(v) = o.pool_max_idle_per_host {
            profile.pool.max_idle_per_host = v;
        }
        if let Some(v) = o.pool_idle_timeout_ms {
            profile.pool.idle_timeout = ms(v);
        }
        for (name, value) in &o.headers {
            profile.headers.insert(name.clone(), value.clone());
        }

        profile.check()?;
        Ok(profile)
    }

    /// Range checks shared by every way of building a profile.
    pub fn check(&self) -> Result<(), String> {
        let mut problems = Vec::new();
        if self.timeouts.connect > self.timeouts.total {
            problems.push(format!(
                "connect timeout {:?} exceeds total timeout {:?}",
                self.timeouts.connect, self.timeouts.total
            ));
        }
        if self.timeouts.total.is_zero() {
            problems.push("total timeout must be greater than 0".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            problems.push(format!(
                "backoff multiplier must be a finite number >= 1.0, got {}",
                self.retry.multiplier
            ));
        }
        if self.rate_limit.max_calls == 0 {
            problems.push("rate_limit_calls must be greater than 0".to_string());
        }
        if self.rate_limit.period.is_zero() {
            problems.push("rate_limit_period_ms must be greater than 0".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            problems.push("breaker_failure_threshold must be greater than 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}
