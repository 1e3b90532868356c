//! Server state-change events
//!
//! The proxy core emits typed events instead of calling back into any
//! logging or UI framework. The embedding application subscribes and
//! renders them however it likes; `Display` provides the human-readable
//! form. The channel is bounded and lossy for slow subscribers, which is
//! acceptable for status strings.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::sync::broadcast;

/// Buffered events per subscriber before the oldest are dropped
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A state change observed by the proxy core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// The listener is bound and accepting
    Listening(SocketAddr),
    /// A source was rejected by the allow/deny lists
    AclRejected(IpAddr),
    /// A source was rejected because it is temporarily blocked
    TempBlockRejected(IpAddr),
    /// A connection was dropped because the session cap was reached
    SessionCapReached(usize),
    /// A source accumulated too many auth failures and was blocked
    TempBlockInstalled {
        /// Blocked source
        ip: IpAddr,
        /// Block length in minutes
        minutes: u64,
    },
    /// A CONNECT bridge is up
    Bridging {
        /// Client source address
        client: SocketAddr,
        /// Target as requested (host may be a domain)
        target: String,
    },
    /// A UDP relay is ready for a client
    UdpReady(SocketAddr),
    /// A session ended abnormally
    SessionError {
        /// Client source address
        client: SocketAddr,
        /// Human-readable cause
        reason: String,
    },
    /// The server stopped accepting
    Stopped,
}

impl fmt::Display for ProxyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening(addr) => write!(f, "listening on {addr}"),
            Self::AclRejected(ip) => write!(f, "rejected {ip}: not permitted by ACL"),
            Self::TempBlockRejected(ip) => write!(f, "rejected {ip}: temporarily blocked"),
            Self::SessionCapReached(max) => {
                write!(f, "rejected connection: session cap {max} reached")
            }
            Self::TempBlockInstalled { ip, minutes } => {
                write!(f, "{ip} exceeded auth failure limit, blocked for {minutes}min")
            }
            Self::Bridging { client, target } => write!(f, "bridging {client} -> {target}"),
            Self::UdpReady(addr) => write!(f, "UDP relay ready on {addr}"),
            Self::SessionError { client, reason } => {
                write!(f, "session {client} failed: {reason}")
            }
            Self::Stopped => write!(f, "server stopped"),
        }
    }
}

/// Broadcast bus carrying [`ProxyEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; a bus with no subscribers swallows it
    pub fn emit(&self, event: ProxyEvent) {
        tracing::info!(event = %event, "proxy state change");
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
