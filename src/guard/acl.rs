//! IP allow/deny rules
//!
//! A rule is either a bare IP literal (exact match) or a CIDR block
//! (prefix containment). Rule lists are immutable once the server starts;
//! they are evaluated for every accepted connection before any protocol
//! bytes are exchanged.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when a rule string cannot be parsed
#[derive(Debug, Error)]
#[error("invalid ACL rule {rule:?}: {reason}")]
pub struct AclParseError {
    /// The offending rule text
    pub rule: String,
    /// Why it was rejected
    pub reason: String,
}

/// A single access-control rule: an IP literal or a CIDR block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AclRule {
    /// Exact IP match, e.g. `192.168.1.10`
    Ip(IpAddr),
    /// CIDR prefix match, e.g. `192.168.1.0/24`
    Cidr(IpNet),
}

impl AclRule {
    /// Check whether `ip` matches this rule
    #[must_use]
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Ip(rule_ip) => *rule_ip == ip,
            Self::Cidr(net) => net.contains(&ip),
        }
    }

    /// Check whether `ip` matches any rule in `rules`
    #[must_use]
    pub fn any_match(ip: IpAddr, rules: &[AclRule]) -> bool {
        rules.iter().any(|rule| rule.matches(ip))
    }
}

impl FromStr for AclRule {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            s.parse::<IpNet>().map(Self::Cidr).map_err(|e| AclParseError {
                rule: s.to_string(),
                reason: e.to_string(),
            })
        } else {
            s.parse::<IpAddr>().map(Self::Ip).map_err(|e| AclParseError {
                rule: s.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

impl TryFrom<String> for AclRule {
    type Error = AclParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AclRule> for String {
    fn from(rule: AclRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for AclRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Cidr(net) => write!(f, "{net}"),
        }
    }
}

/// Parse a list of rule strings, failing on the first invalid entry
///
/// # Errors
///
/// Returns `AclParseError` for the first rule that is neither an IP literal
/// nor a valid CIDR block.
pub fn parse_rules<S: AsRef<str>>(rules: &[S]) -> Result<Vec<AclRule>, AclParseError> {
    rules.iter().map(|s| s.as_ref().parse()).collect()
}
