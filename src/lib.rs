//! egress-socks: SOCKS5 proxy server with pinned egress
//!
//! A SOCKS5 (RFC 1928) server whose outbound traffic leaves through a
//! caller-supplied egress path rather than the default route. The embedding
//! application provides an [`egress::OutboundNetworkProvider`]; everything
//! else - method negotiation, username/password authentication (RFC 1929),
//! CONNECT bridging, UDP ASSOCIATE relaying, admission control, and
//! statistics - lives in this crate.
//!
//! # Architecture
//!
//! ```text
//! Client → Socks5Server → AccessGuard → Socks5Session → OutboundNetworkProvider → Target
//!                                            ↓
//!                                   pipe() / UdpRelay
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use egress_socks::egress::SystemNetworkProvider;
//! use egress_socks::server::{ServerConfig, Socks5Server};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::new("127.0.0.1:1080".parse()?)
//!     .with_auth("user", "secret");
//! let server = Socks5Server::new(config, Arc::new(SystemNetworkProvider))?;
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`egress`]: Outbound network capability and bundled providers
//! - [`events`]: Typed server events and the broadcast bus
//! - [`guard`]: Allow/deny lists and auth-failure throttling
//! - [`io`]: Bidirectional byte pipe
//! - [`server`]: Listener, sessions, configuration, statistics
//! - [`socks5`]: Protocol constants and wire types
//! - [`udp`]: UDP ASSOCIATE relay

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod egress;
pub mod events;
pub mod guard;
pub mod io;
pub mod server;
pub mod socks5;
pub mod udp;

// Re-export commonly used types at the crate root
pub use egress::{EgressError, OutboundNetworkProvider, SystemNetworkProvider};
pub use events::{EventBus, ProxyEvent};
pub use guard::{AccessGuard, AclRule};
pub use io::{pipe, PipeSummary};
pub use server::{
    load_config, ServerConfig, ServerError, ServerStats, SessionError, Socks5Server,
    StatsSnapshot,
};
pub use socks5::{Command, ProxyRequest, TargetAddr};
pub use udp::UdpRelay;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
