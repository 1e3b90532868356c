//! Server configuration
//!
//! All knobs the embedding application supplies at construction time:
//! listen address, optional credentials, session cap, ACL lists, throttle
//! parameters, and timeouts. Loadable from JSON; every field except the
//! listen address has a default.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ConfigError, ConfigResult};
use crate::guard::AclRule;

/// Username/password credentials for RFC 1929 authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Expected username (exact match)
    pub username: String,
    /// Expected password (exact match)
    pub password: String,
}

impl AuthConfig {
    /// Create credentials
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Configuration for a [`Socks5Server`](super::Socks5Server)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address and port to listen on
    pub listen: SocketAddr,

    /// Credentials; when absent the server only offers "no auth"
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// When present, only matching sources may connect
    #[serde(default)]
    pub allow: Option<Vec<AclRule>>,

    /// Matching sources are always rejected; deny wins over allow
    #[serde(default)]
    pub deny: Vec<AclRule>,

    /// Auth failures within a 60 s window that trigger a temporary block
    #[serde(default = "default_auth_fail_threshold")]
    pub auth_fail_threshold: u32,

    /// Length of a triggered block, in minutes
    #[serde(default = "default_temp_block_minutes")]
    pub temp_block_minutes: u64,

    /// Whether UDP ASSOCIATE is serviced
    #[serde(default = "default_udp_enabled")]
    pub udp_enabled: bool,

    /// Idle timeout for UDP NAT entries, in milliseconds
    #[serde(default = "default_udp_nat_timeout_ms")]
    pub udp_nat_timeout_ms: u64,

    /// Bound on outbound TCP connect attempts, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bound on client reads during the handshake phases, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Linux network device to pin egress to (`SO_BINDTODEVICE`); when
    /// absent the default route is used
    #[serde(default)]
    pub egress_device: Option<String>,
}

fn default_max_sessions() -> usize {
    128
}

fn default_auth_fail_threshold() -> u32 {
    10
}

fn default_temp_block_minutes() -> u64 {
    10
}

fn default_udp_enabled() -> bool {
    true
}

fn default_udp_nat_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_secs() -> u64 {
    12
}

fn default_handshake_timeout_secs() -> u64 {
    15
}

impl ServerConfig {
    /// Create a configuration listening on `listen` with defaults elsewhere
    #[must_use]
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            auth: None,
            max_sessions: default_max_sessions(),
            allow: None,
            deny: Vec::new(),
            auth_fail_threshold: default_auth_fail_threshold(),
            temp_block_minutes: default_temp_block_minutes(),
            udp_enabled: default_udp_enabled(),
            udp_nat_timeout_ms: default_udp_nat_timeout_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            egress_device: None,
        }
    }

    /// Require username/password authentication
    #[must_use]
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(AuthConfig::new(username, password));
        self
    }

    /// Set the concurrent session cap
    #[must_use]
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Restrict sources to the given allow list
    #[must_use]
    pub fn with_allow_list(mut self, allow: Vec<AclRule>) -> Self {
        self.allow = Some(allow);
        self
    }

    /// Reject the given sources
    #[must_use]
    pub fn with_deny_list(mut self, deny: Vec<AclRule>) -> Self {
        self.deny = deny;
        self
    }

    /// Set the auth-failure threshold and block duration
    #[must_use]
    pub fn with_throttle(mut self, threshold: u32, block_minutes: u64) -> Self {
        self.auth_fail_threshold = threshold;
        self.temp_block_minutes = block_minutes;
        self
    }

    /// Enable or disable UDP ASSOCIATE
    #[must_use]
    pub fn with_udp(mut self, enabled: bool) -> Self {
        self.udp_enabled = enabled;
        self
    }

    /// Set the NAT idle timeout
    #[must_use]
    pub fn with_nat_timeout(mut self, timeout: Duration) -> Self {
        self.udp_nat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Pin egress to a Linux network device
    #[must_use]
    pub fn with_egress_device(mut self, device: impl Into<String>) -> Self {
        self.egress_device = Some(device.into());
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for empty credentials, a zero session
    /// cap, or a zero failure threshold.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(auth) = &self.auth {
            if auth.username.is_empty() || auth.password.is_empty() {
                return Err(ConfigError::invalid(
                    "username and password must be non-empty when auth is configured",
                ));
            }
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::invalid("max_sessions must be at least 1"));
        }
        if self.auth_fail_threshold == 0 {
            return Err(ConfigError::invalid(
                "auth_fail_threshold must be at least 1",
            ));
        }
        if self.udp_nat_timeout_ms == 0 {
            return Err(ConfigError::invalid("udp_nat_timeout_ms must be non-zero"));
        }
        Ok(())
    }

    /// Connect timeout as a [`Duration`]
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Handshake read timeout as a [`Duration`]
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// NAT idle timeout as a [`Duration`]
    #[must_use]
    pub fn nat_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_nat_timeout_ms)
    }

    /// Temporary block length as a [`Duration`]
    #[must_use]
    pub fn temp_block(&self) -> Duration {
        Duration::from_secs(self.temp_block_minutes * 60)
    }
}

/// Load a configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file is missing, unreadable, unparsable,
/// or fails validation.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<ServerConfig> {
    let path = path.as_ref();
    debug!(?path, "loading configuration");

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    load_config_str(&contents)
}

/// Load a configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` on parse or validation failure.
pub fn load_config_str(json: &str) -> ConfigResult<ServerConfig> {
    let config: ServerConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::parse_rules;

    fn listen() -> SocketAddr {
        "192.168.1.2:1080".parse().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(listen());
        assert_eq!(config.max_sessions, 128);
        assert_eq!(config.auth_fail_threshold, 10);
        assert_eq!(config.temp_block_minutes, 10);
        assert!(config.udp_enabled);
        assert_eq!(config.nat_timeout(), Duration::from_secs(60));
        assert_eq!(config.connect_timeout(), Duration::from_secs(12));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(15));
        assert!(config.auth.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new(listen())
            .with_auth("user", "pass")
            .with_max_sessions(4)
            .with_udp(false)
            .with_throttle(3, 1)
            .with_deny_list(parse_rules(&["10.0.0.0/8"]).unwrap());

        assert_eq!(config.auth, Some(AuthConfig::new("user", "pass")));
        assert_eq!(config.max_sessions, 4);
        assert!(!config.udp_enabled);
        assert_eq!(config.auth_fail_threshold, 3);
        assert_eq!(config.temp_block(), Duration::from_secs(60));
        assert_eq!(config.deny.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_credentials() {
        let config = ServerConfig::new(listen()).with_auth("", "pass");
        assert!(config.validate().is_err());

        let config = ServerConfig::new(listen()).with_auth("user", "");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_knobs() {
        assert!(ServerConfig::new(listen())
            .with_max_sessions(0)
            .validate()
            .is_err());
        assert!(ServerConfig::new(listen())
            .with_throttle(0, 10)
            .validate()
            .is_err());
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{
            "listen": "0.0.0.0:1080",
            "auth": { "username": "user", "password": "pass" },
            "allow": ["192.168.1.0/24"],
            "deny": ["192.168.1.66"],
            "max_sessions": 64
        }"#;
        let config = load_config_str(json).unwrap();

        assert_eq!(config.listen.port(), 1080);
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.allow.as_ref().unwrap().len(), 1);
        assert_eq!(config.deny.len(), 1);
        // Unspecified fields fall back to defaults
        assert_eq!(config.auth_fail_threshold, 10);
        assert!(config.udp_enabled);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        assert!(load_config_str("{").is_err());
        assert!(load_config_str(r#"{"listen": "not-an-addr"}"#).is_err());
        // Valid JSON, invalid semantics
        assert!(load_config_str(
            r#"{"listen": "0.0.0.0:1080", "max_sessions": 0}"#
        )
        .is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config("/nonexistent/egress-socks.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = ServerConfig::new(listen())
            .with_auth("user", "secret")
            .with_allow_list(parse_rules(&["10.0.0.0/8"]).unwrap());
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("secret"));
        assert!(json.contains("10.0.0.0/8"));

        let back = load_config_str(&json).unwrap();
        assert_eq!(back.auth, config.auth);
        assert_eq!(back.allow, config.allow);
    }
}
