//! # Retry
//!
//! Exponential backoff policy and the classification rules that decide whether a failed
//! attempt may be tried again.
use std::collections::BTreeSet;
use std::time::Duration;

use reqwest::{header::HeaderMap, Method, StatusCode};

/// Exponential backoff policy.
///
/// - base_delay: unit of the backoff curve, one second unless configured otherwise
/// - multiplier: factor by which delay grows each attempt (>= 1.0)
/// - max_delay: cap for the computed delay
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub retryable_statuses: BTreeSet<u16>,
    pub retryable_methods: Vec<Method>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            retryable_statuses: BTreeSet::from([408, 429, 500, 502, 503, 504]),
            retryable_methods: vec![Method::GET, Method::HEAD, Method::OPTIONS],
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, `min(max_delay, base_delay * multiplier^attempt)`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let pow = self
            .multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let nanos = self.base_delay.as_nanos() as f64 * pow;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Like [`RetryPolicy::next_delay`], but a server supplied `Retry-After` wins when it asks
    /// us to wait longer than we would have anyway.
    pub fn retry_interval(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.next_delay(attempt);
        match retry_after {
            Some(preferred) if preferred > computed => preferred,
            _ => computed,
        }
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status.as_u16())
    }

    pub fn is_retryable_method(&self, method: &Method) -> bool {
        self.retryable_methods.contains(method)
    }
}

/// Attempt to parse a Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
pub fn parse_retry_after_header(header_map: &HeaderMap) -> Option<Duration> {
    let retry_after = header_map
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration = chrono::DateTime::<chrono::Utc>::from(dt) - chrono::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_progression_and_cap() {
        let p = RetryPolicy::default();

        // attempt -> expected seconds (cap at 60s)
        let cases = vec![(0, 1), (1, 2), (2, 4), (3, 8), (5, 32), (6, 60), (40, 60)];

        for (attempt, expected_secs) in cases {
            let d = p.next_delay(attempt);
            assert_eq!(d.as_secs(), expected_secs, "attempt {attempt}");
        }
    }

    #[test]
    fn test_custom_policy_progression() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(5),
            multiplier: 3.0,
            max_delay: Duration::from_millis(70),
            ..Default::default()
        };
        let cases = vec![(0, 5), (1, 15), (2, 45), (3, 70), (4, 70)];
        for (attempt, expected_ms) in cases {
            let d = p.next_delay(attempt);
            assert_eq!(d.as_millis(), expected_ms, "attempt {attempt}");
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = RetryPolicy::default();
        assert_eq!(p.next_delay(u32::MAX), p.max_delay);
    }

    #[test]
    fn test_retry_after_only_wins_when_longer() {
        let p = RetryPolicy::default();
        assert_eq!(
            p.retry_interval(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            p.retry_interval(3, Some(Duration::from_secs(1))),
            Duration::from_secs(8)
        );
        assert_eq!(p.retry_interval(0, None), Duration::from_secs(1));
    }

    #[test]
    fn test_is_retryable_status() {
        let p = RetryPolicy::default();
        assert!(!p.is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!p.is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!p.is_retryable_status(StatusCode::NOT_FOUND));
        assert!(p.is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(p.is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn test_is_retryable_method() {
        let p = RetryPolicy::default();
        assert!(p.is_retryable_method(&Method::GET));
        assert!(!p.is_retryable_method(&Method::POST));
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());

        let duration = parse_retry_after_header(&headers).unwrap();
        assert_eq!(duration, Duration::from_secs(120));

        headers.remove(reqwest::header::RETRY_AFTER);
        assert_eq!(parse_retry_after_header(&headers), None);

        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        // a date in the past can't be waited for
        assert_eq!(parse_retry_after_header(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_future_date() {
        let mut headers = HeaderMap::new();
        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        headers.insert(
            reqwest::header::RETRY_AFTER,
            future.to_rfc2822().parse().unwrap(),
        );
        let duration = parse_retry_after_header(&headers).unwrap();
        assert!(duration <= Duration::from_secs(90));
        assert!(duration >= Duration::from_secs(80));
    }
}
