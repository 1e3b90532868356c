//! Error types for the server and its sessions
//!
//! Taxonomy mirrors how failures behave at runtime: configuration problems
//! stop construction, bind problems stop `serve()`, protocol violations and
//! transport failures end only the session they occur in.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::egress::EgressError;
use crate::socks5::AddrError;
use crate::udp::RelayError;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file does not exist
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// The missing path
        path: String,
    },

    /// JSON parse failure
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Semantically invalid configuration
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// I/O failure reading the file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    /// Create an invalid-configuration error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Result alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised by the listener
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listen socket
    #[error("failed to bind {addr}: {reason}")]
    BindFailed {
        /// Address that failed to bind
        addr: SocketAddr,
        /// Why it failed
        reason: String,
    },

    /// Configuration rejected at construction
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport failure in the accept loop
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Create a bind-failed error
    pub fn bind_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            addr,
            reason: reason.into(),
        }
    }
}

/// Result alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that terminate a single session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed handshake or request bytes
    #[error("protocol violation: {0}")]
    Protocol(#[from] AddrError),

    /// Client idled past the handshake read timeout
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Egress failure surfaced mid-session
    #[error(transparent)]
    Egress(#[from] EgressError),

    /// UDP relay failure surfaced mid-session
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Transport failure on the client connection
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
