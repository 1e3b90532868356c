//! SOCKS5 server: configuration, admission, sessions, statistics
//!
//! [`Socks5Server`] is the embedding application's entry point: construct
//! it from a [`ServerConfig`] and an egress provider, call
//! [`serve`](Socks5Server::serve), observe progress through events and
//! statistics, and call [`shutdown`](Socks5Server::shutdown) to stop.

mod config;
mod error;
mod listener;
mod session;
mod stats;

pub use config::{load_config, load_config_str, AuthConfig, ServerConfig};
pub use error::{
    ConfigError, ConfigResult, ServerError, ServerResult, SessionError, SessionResult,
};
pub use listener::Socks5Server;
pub use session::Socks5Session;
pub use stats::{ServerStats, SessionGuard, StatsSnapshot};
