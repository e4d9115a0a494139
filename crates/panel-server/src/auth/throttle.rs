//! Per-address login throttle.
//!
//! Counts failed logins per source address inside a window that restarts
//! once it has fully elapsed. Reaching the failure threshold locks the
//! address out for a fixed period. A successful login clears the record.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Throttle thresholds.
#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicy {
    /// Failures within one window that trigger a lockout.
    pub max_failures: u32,
    /// Length of the failure-counting window.
    pub window: Duration,
    /// How long an address stays locked out.
    pub lockout: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_failures: 10,
            window: Duration::from_secs(15 * 60),
            lockout: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    failure_count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Sliding-window failure counter keyed by source address.
#[derive(Debug)]
pub struct LoginThrottle {
    policy: ThrottlePolicy,
    records: RwLock<HashMap<String, AttemptRecord>>,
}

impl LoginThrottle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Key used for an IP address.
    pub fn key_for(ip: &IpAddr) -> String {
        ip.to_string()
    }

    /// If the address is locked out, how long until it may try again
    /// (never less than one second).
    pub async fn is_blocked(&self, source: &str) -> Option<Duration> {
        let now = Instant::now();
        let records = self.records.read().await;
        let until = records.get(source)?.blocked_until?;
        if until <= now {
            return None;
        }
        Some(round_up_secs(until - now))
    }

    /// Count a failed login from `source`.
    pub async fn record_failure(&self, source: &str) {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let record = records
            .entry(source.to_string())
            .or_insert_with(|| AttemptRecord {
                failure_count: 0,
                window_start: now,
                blocked_until: None,
            });

        if now.duration_since(record.window_start) >= self.policy.window {
            record.failure_count = 0;
            record.window_start = now;
            record.blocked_until = None;
        }

        record.failure_count += 1;
        debug!(source, failures = record.failure_count, "login failure recorded");

        if record.failure_count >= self.policy.max_failures {
            record.blocked_until = Some(now + self.policy.lockout);
            warn!(
                source,
                failures = record.failure_count,
                lockout_secs = self.policy.lockout.as_secs(),
                "too many failed logins, address locked out"
            );
        }
    }

    /// Forget everything about `source` after a successful login.
    pub async fn record_success(&self, source: &str) {
        self.records.write().await.remove(source);
    }

    /// Garbage-collect records whose window and lockout have both lapsed.
    pub async fn gc(&self) -> usize {
        let now = Instant::now();
        let window = self.policy.window;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| {
            let locked = r.blocked_until.is_some_and(|until| until > now);
            locked || now.duration_since(r.window_start) < window
        });
        before - records.len()
    }
}

fn round_up_secs(d: Duration) -> Duration {
    let mut secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs += 1;
    }
    Duration::from_secs(secs.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "203.0.113.7";

    #[tokio::test(start_paused = true)]
    async fn ten_failures_block_the_eleventh_attempt() {
        let throttle = LoginThrottle::new(ThrottlePolicy::default());
        for _ in 0..9 {
            throttle.record_failure(ADDR).await;
            assert_eq!(throttle.is_blocked(ADDR).await, None);
        }
        throttle.record_failure(ADDR).await;

        let retry_after = throttle.is_blocked(ADDR).await.expect("blocked");
        assert!(retry_after > Duration::ZERO);
        assert_eq!(retry_after, Duration::from_secs(15 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn success_before_threshold_resets_counter() {
        let throttle = LoginThrottle::new(ThrottlePolicy::default());
        for _ in 0..9 {
            throttle.record_failure(ADDR).await;
        }
        throttle.record_success(ADDR).await;

        // Nine more failures would have crossed the threshold without the reset.
        for _ in 0..9 {
            throttle.record_failure(ADDR).await;
        }
        assert_eq!(throttle.is_blocked(ADDR).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn window_restarts_after_it_elapses() {
        let throttle = LoginThrottle::new(ThrottlePolicy::default());
        for _ in 0..9 {
            throttle.record_failure(ADDR).await;
        }
        tokio::time::advance(Duration::from_secs(15 * 60)).await;
        throttle.record_failure(ADDR).await;
        assert_eq!(throttle.is_blocked(ADDR).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn lockout_expires() {
        let throttle = LoginThrottle::new(ThrottlePolicy {
            max_failures: 2,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(30),
        });
        throttle.record_failure(ADDR).await;
        throttle.record_failure(ADDR).await;
        assert!(throttle.is_blocked(ADDR).await.is_some());

        tokio::time::advance(Duration::from_millis(29_500)).await;
        assert_eq!(throttle.is_blocked(ADDR).await, Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(throttle.is_blocked(ADDR).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn addresses_are_independent() {
        let throttle = LoginThrottle::new(ThrottlePolicy {
            max_failures: 1,
            ..Default::default()
        });
        throttle.record_failure(ADDR).await;
        assert!(throttle.is_blocked(ADDR).await.is_some());
        assert_eq!(throttle.is_blocked("198.51.100.1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_keeps_active_lockouts() {
        let throttle = LoginThrottle::new(ThrottlePolicy {
            max_failures: 1,
            window: Duration::from_secs(10),
            lockout: Duration::from_secs(100),
        });
        throttle.record_failure(ADDR).await;
        throttle.record_failure("198.51.100.1").await;
        throttle.record_success("198.51.100.1").await;
        throttle.record_failure("198.51.100.2").await;

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(throttle.gc().await, 0, "both remaining records are locked out");

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(throttle.gc().await, 2);
    }

    #[test]
    fn ip_keys() {
        let ip: IpAddr = "::1".parse().unwrap();
        assert_eq!(LoginThrottle::key_for(&ip), "::1");
    }
}
