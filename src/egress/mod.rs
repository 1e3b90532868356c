//! Outbound network capability
//!
//! The proxy engine never discovers or selects the egress path itself. It
//! consumes an [`OutboundNetworkProvider`], an object-safe capability that
//! produces egress-pinned outbound TCP connections, binds UDP sockets onto
//! the egress path, and answers whether a path is currently available.
//! Concrete adapters (platform connectivity managers, routing-table
//! manipulation) live in the embedding application; this module ships the
//! two implementations that need no platform help.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::socks5::TargetAddr;

/// Default bound on outbound TCP connect attempts
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

/// Errors raised by egress providers
#[derive(Debug, Error)]
pub enum EgressError {
    /// No egress path is currently available
    #[error("no egress network available")]
    Unavailable,

    /// The connect attempt exceeded its deadline
    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target that was being connected
        target: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Name resolution or transport failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for egress operations
pub type EgressResult<T> = Result<T, EgressError>;

/// Capability for producing egress-pinned outbound connections
///
/// Implementations must degrade gracefully: when the egress path is gone,
/// `is_available` returns `false` and `connect_tcp` fails with
/// [`EgressError::Unavailable`] rather than falling back to another route.
#[async_trait]
pub trait OutboundNetworkProvider: Send + Sync {
    /// Whether an egress path is currently usable
    fn is_available(&self) -> bool;

    /// Open an outbound TCP connection to `target` over the egress path,
    /// bounded by `connect_timeout`
    ///
    /// # Errors
    ///
    /// Returns `EgressError` when no path is available, the deadline
    /// elapses, or the transport fails.
    async fn connect_tcp(
        &self,
        target: &TargetAddr,
        connect_timeout: Duration,
    ) -> EgressResult<TcpStream>;

    /// Pin an already-bound UDP socket onto the egress path
    ///
    /// Called before the socket enters the relay's pump loop. A no-op for
    /// providers whose egress is the default route.
    ///
    /// # Errors
    ///
    /// Returns `EgressError` if the socket cannot be moved onto the path.
    fn bind_udp(&self, socket: &std::net::UdpSocket) -> EgressResult<()>;
}

/// Resolve and dial with a deadline, shared by the bundled providers
async fn dial(target: &TargetAddr, connect_timeout: Duration) -> EgressResult<TcpStream> {
    let addr: SocketAddr = target.resolve().await?;
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| EgressError::ConnectTimeout {
            target: target.to_string(),
            timeout: connect_timeout,
        })??;
    stream.set_nodelay(true)?;
    debug!(%target, local = ?stream.local_addr().ok(), "outbound connection established");
    Ok(stream)
}

/// Default-route provider: always available, no pinning
///
/// Useful for tests and for deployments where the routing table already
/// sends traffic out the desired interface.
#[derive(Debug, Default, Clone)]
pub struct SystemNetworkProvider;

#[async_trait]
impl OutboundNetworkProvider for SystemNetworkProvider {
    fn is_available(&self) -> bool {
        true
    }

    async fn connect_tcp(
        &self,
        target: &TargetAddr,
        connect_timeout: Duration,
    ) -> EgressResult<TcpStream> {
        dial(target, connect_timeout).await
    }

    fn bind_udp(&self, _socket: &std::net::UdpSocket) -> EgressResult<()> {
        Ok(())
    }
}

/// Interface-pinned provider (`SO_BINDTODEVICE`, Linux only)
///
/// The simplest concrete form of "egress through a specific interface":
/// every outbound socket is bound to the named device before connecting.
/// Requires `CAP_NET_RAW` or root.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct InterfaceProvider {
    device: String,
}

#[cfg(target_os = "linux")]
impl InterfaceProvider {
    /// Pin all egress to `device` (e.g. `wwan0`)
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    /// The pinned device name
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    fn bind_to_device(&self, socket: &socket2::Socket) -> io::Result<()> {
        socket.bind_device(Some(self.device.as_bytes()))
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl OutboundNetworkProvider for InterfaceProvider {
    fn is_available(&self) -> bool {
        // The device list is cheap to consult and reflects hot-plug state
        std::path::Path::new("/sys/class/net").join(&self.device).exists()
    }

    async fn connect_tcp(
        &self,
        target: &TargetAddr,
        connect_timeout: Duration,
    ) -> EgressResult<TcpStream> {
        if !self.is_available() {
            return Err(EgressError::Unavailable);
        }

        let addr: SocketAddr = target.resolve().await?;
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
        self.bind_to_device(&socket)?;
        socket.set_nonblocking(true)?;

        let tcp_socket =
            tokio::net::TcpSocket::from_std_stream(std::net::TcpStream::from(socket));
        let stream = timeout(connect_timeout, tcp_socket.connect(addr))
            .await
            .map_err(|_| EgressError::ConnectTimeout {
                target: target.to_string(),
                timeout: connect_timeout,
            })??;
        stream.set_nodelay(true)?;
        debug!(%target, device = %self.device, "outbound connection established on pinned device");
        Ok(stream)
    }

    fn bind_udp(&self, socket: &std::net::UdpSocket) -> EgressResult<()> {
        if !self.is_available() {
            return Err(EgressError::Unavailable);
        }
        let sock = socket2::SockRef::from(socket);
        sock.bind_device(Some(self.device.as_bytes()))?;
        Ok(())
    }
}

/// Provider that reports no available path; every operation fails
///
/// Stands in for a detached platform network during tests and degraded
/// operation.
#[derive(Debug, Default, Clone)]
pub struct UnavailableNetworkProvider;

#[async_trait]
impl OutboundNetworkProvider for UnavailableNetworkProvider {
    fn is_available(&self) -> bool {
        false
    }

    async fn connect_tcp(
        &self,
        _target: &TargetAddr,
        _connect_timeout: Duration,
    ) -> EgressResult<TcpStream> {
        Err(EgressError::Unavailable)
    }

    fn bind_udp(&self, _socket: &std::net::UdpSocket) -> EgressResult<()> {
        Err(EgressError::Unavailable)
    }
}
