//! Authentication-failure throttling
//!
//! Tracks a sliding 60-second window of failed authentication attempts per
//! source IP. When the count inside the window reaches the configured
//! threshold, the IP receives a temporary block and the window resets. All
//! maps tolerate concurrent access from many sessions.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

/// Width of the sliding failure window
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window failure counter with temporary blocking
#[derive(Debug)]
pub struct FailureThrottle {
    /// Failure timestamps per IP, pruned of stale entries on every access
    windows: DashMap<IpAddr, Vec<Instant>>,
    /// Block expiry instants per IP
    blocked_until: DashMap<IpAddr, Instant>,
    /// Failures within the window that trigger a block
    threshold: u32,
    /// How long a triggered block lasts
    block_duration: Duration,
}

impl FailureThrottle {
    /// Create a throttle with the given threshold and block duration
    #[must_use]
    pub fn new(threshold: u32, block_duration: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            blocked_until: DashMap::new(),
            threshold,
            block_duration,
        }
    }

    /// Record an authentication failure for `ip`
    ///
    /// Appends the current instant to the IP's window, prunes entries older
    /// than [`FAILURE_WINDOW`], and installs a temporary block when the
    /// remaining count reaches the threshold. Returns `true` when a block
    /// was installed by this call.
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut window = self.windows.entry(ip).or_default();
        window.push(now);
        window.retain(|t| now.duration_since(*t) < FAILURE_WINDOW);

        debug!(%ip, failures = window.len(), "auth failure recorded");

        if window.len() as u32 >= self.threshold {
            self.blocked_until.insert(ip, now + self.block_duration);
            window.clear();
            info!(
                %ip,
                block_secs = self.block_duration.as_secs(),
                "auth failure threshold reached, temporary block installed"
            );
            return true;
        }
        false
    }

    /// Check whether `ip` is currently blocked
    ///
    /// Expired blocks are removed as a side effect.
    #[must_use]
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        if let Some(expiry) = self.blocked_until.get(&ip) {
            if *expiry > now {
                return true;
            }
        }
        self.blocked_until.remove_if(&ip, |_, expiry| *expiry <= now);
        false
    }

    /// Current failure count inside `ip`'s window
    #[must_use]
    pub fn failure_count(&self, ip: IpAddr) -> usize {
        let now = Instant::now();
        self.windows
            .get(&ip)
            .map(|w| {
                w.iter()
                    .filter(|t| now.duration_since(**t) < FAILURE_WINDOW)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_below_threshold_not_blocked() {
        let throttle = FailureThrottle::new(10, Duration::from_secs(600));
        let client = ip("10.0.0.1");

        for _ in 0..9 {
            assert!(!throttle.record_failure(client));
        }
        assert!(!throttle.is_blocked(client));
        assert_eq!(throttle.failure_count(client), 9);
    }

    #[test]
    fn test_threshold_installs_block_and_clears_window() {
        let throttle = FailureThrottle::new(3, Duration::from_secs(600));
        let client = ip("10.0.0.2");

        assert!(!throttle.record_failure(client));
        assert!(!throttle.record_failure(client));
        assert!(throttle.record_failure(client));

        assert!(throttle.is_blocked(client));
        // The window resets once the block is installed
        assert_eq!(throttle.failure_count(client), 0);
    }

    #[test]
    fn test_block_expires() {
        let throttle = FailureThrottle::new(1, Duration::from_millis(50));
        let client = ip("10.0.0.3");

        throttle.record_failure(client);
        assert!(throttle.is_blocked(client));

        std::thread::sleep(Duration::from_millis(80));
        assert!(!throttle.is_blocked(client));
        // And again immediately afterwards - the stale entry is gone
        assert!(!throttle.is_blocked(client));
    }

    #[test]
    fn test_ips_tracked_independently() {
        let throttle = FailureThrottle::new(2, Duration::from_secs(600));
        let a = ip("10.0.0.4");
        let b = ip("10.0.0.5");

        throttle.record_failure(a);
        throttle.record_failure(a);
        throttle.record_failure(b);

        assert!(throttle.is_blocked(a));
        assert!(!throttle.is_blocked(b));
    }

    #[test]
    fn test_concurrent_failures() {
        use std::sync::Arc;

        let throttle = Arc::new(FailureThrottle::new(1000, Duration::from_secs(600)));
        let client = ip("10.0.0.6");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&throttle);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        t.record_failure(client);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(throttle.failure_count(client), 400);
        assert!(!throttle.is_blocked(client));
    }
}
