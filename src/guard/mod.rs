//! Connection admission policy
//!
//! The access guard bundles the stateless checks (allow/deny lists) with the
//! stateful abuse tracking (auth-failure windows, temporary blocks) behind
//! one shared handle. A single `Arc<AccessGuard>` is threaded into the
//! listener and every session; there are no global singletons.

mod acl;
mod throttle;

pub use acl::{parse_rules, AclParseError, AclRule};
pub use throttle::{FailureThrottle, FAILURE_WINDOW};

use std::net::IpAddr;
use std::time::Duration;

/// Combined ACL + throttle policy evaluated per incoming connection
#[derive(Debug)]
pub struct AccessGuard {
    /// When present, sources must match at least one entry
    allow: Option<Vec<AclRule>>,
    /// Sources matching any entry are rejected; deny wins over allow
    deny: Vec<AclRule>,
    throttle: FailureThrottle,
}

impl AccessGuard {
    /// Create a guard from rule lists and throttle parameters
    #[must_use]
    pub fn new(
        allow: Option<Vec<AclRule>>,
        deny: Vec<AclRule>,
        auth_fail_threshold: u32,
        temp_block: Duration,
    ) -> Self {
        Self {
            allow,
            deny,
            throttle: FailureThrottle::new(auth_fail_threshold, temp_block),
        }
    }

    /// Evaluate the static rule lists for `ip`
    ///
    /// Returns `false` when `ip` matches a deny rule, or when an allow list
    /// is configured and `ip` matches none of its entries.
    #[must_use]
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if AclRule::any_match(ip, &self.deny) {
            return false;
        }
        match &self.allow {
            Some(allow) => AclRule::any_match(ip, allow),
            None => true,
        }
    }

    /// Whether `ip` is inside an active temporary block
    #[must_use]
    pub fn is_temporarily_blocked(&self, ip: IpAddr) -> bool {
        self.throttle.is_blocked(ip)
    }

    /// Report a failed authentication attempt from `ip`
    ///
    /// This is the sole path by which the sliding-window throttle
    /// accumulates. Returns `true` when this failure tripped the threshold.
    pub fn record_auth_failure(&self, ip: IpAddr) -> bool {
        self.throttle.record_failure(ip)
    }

    /// Access the underlying throttle (used by tests and telemetry)
    #[must_use]
    pub fn throttle(&self) -> &FailureThrottle {
        &self.throttle
    }
}
