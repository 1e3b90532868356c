//! UDP ASSOCIATE relay
//!
//! One relay per ASSOCIATE request. The relay owns a single UDP socket and
//! a NAT table keyed by client source address. Two tasks run for the
//! socket's lifetime: the packet pump (classify, translate, forward) and a
//! garbage collector that expires idle NAT entries. SOCKS5 has no UDP
//! session-end message, so expiry by idle timeout is the only passive
//! teardown; `stop()` is invoked when the controlling TCP connection closes.

mod packet;

pub use packet::{
    decode_client_packet, encode_reply, looks_like_client_packet, ClientDatagram, PacketError,
};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::egress::{EgressError, OutboundNetworkProvider};

/// Default idle timeout for NAT entries; also the GC scan interval
pub const DEFAULT_NAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Receive buffer size for the packet pump
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Errors raised while setting up or running a relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Failed to bind the relay socket
    #[error("failed to bind UDP relay on {addr}: {source}")]
    BindFailed {
        /// Address that failed to bind
        addr: SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },

    /// The egress provider refused the socket
    #[error("egress binding failed: {0}")]
    Egress(#[from] EgressError),

    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// One NAT mapping: a client's UDP source address and the remote
/// destination it last addressed
#[derive(Debug, Clone)]
struct NatEntry {
    /// Resolved remote destination
    remote: SocketAddr,
    /// Refreshed on every datagram involving this client
    last_activity: Instant,
}

impl NatEntry {
    fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

/// UDP relay bound to one local socket
///
/// The pump task is the socket's only owner; aborting it in [`stop`]
/// (UdpRelay::stop) closes the socket and releases the port.
pub struct UdpRelay {
    nat: Arc<DashMap<SocketAddr, NatEntry>>,
    nat_timeout: Duration,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpRelay {
    /// Bind a relay socket and start its pump and GC tasks
    ///
    /// Binds `bind_ip:preferred_port` (ephemeral when `preferred_port` is 0)
    /// with `SO_REUSEADDR`, offers the raw socket to `provider` for egress
    /// pinning, then spawns the two relay tasks. The actual bound port is
    /// available via [`local_addr`](Self::local_addr).
    ///
    /// # Errors
    ///
    /// Returns `RelayError` if binding fails or the provider rejects the
    /// socket.
    pub fn start(
        bind_ip: IpAddr,
        preferred_port: u16,
        provider: Option<&dyn OutboundNetworkProvider>,
        nat_timeout: Duration,
    ) -> RelayResult<Self> {
        let bind_addr = SocketAddr::new(bind_ip, preferred_port);

        let domain = if bind_addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, None)
            .map_err(|source| RelayError::BindFailed { addr: bind_addr, source })?;
        raw.set_reuse_address(true)
            .map_err(|source| RelayError::BindFailed { addr: bind_addr, source })?;
        raw.bind(&bind_addr.into())
            .map_err(|source| RelayError::BindFailed { addr: bind_addr, source })?;

        let std_socket: std::net::UdpSocket = raw.into();
        if let Some(provider) = provider {
            provider.bind_udp(&std_socket)?;
        }
        std_socket.set_nonblocking(true)?;

        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;

        let relay = Self {
            nat: Arc::new(DashMap::new()),
            nat_timeout,
            local_addr,
            tasks: Mutex::new(Vec::with_capacity(2)),
        };

        let pump = tokio::spawn(pump_loop(socket, Arc::clone(&relay.nat)));
        let gc = tokio::spawn(gc_loop(Arc::clone(&relay.nat), nat_timeout));
        relay.tasks.lock().extend([pump, gc]);

        debug!(local = %local_addr, "UDP relay started");
        Ok(relay)
    }

    /// The address the relay socket is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live NAT entries
    #[must_use]
    pub fn nat_entries(&self) -> usize {
        self.nat.len()
    }

    /// Stop the relay: abort both tasks and clear the NAT table
    ///
    /// The socket closes once the aborted pump task drops its handle.
    /// Idempotent.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.nat.clear();
        debug!(local = %self.local_addr, "UDP relay stopped");
    }
}

impl Drop for UdpRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for UdpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRelay")
            .field("local_addr", &self.local_addr)
            .field("nat_entries", &self.nat.len())
            .field("nat_timeout", &self.nat_timeout)
            .finish()
    }
}

/// Receive loop: classify each datagram and translate in the right direction
async fn pump_loop(socket: Arc<UdpSocket>, nat: Arc<DashMap<SocketAddr, NatEntry>>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "UDP relay receive failed, pump exiting");
                return;
            }
        };
        let data = &buf[..len];

        if looks_like_client_packet(data) {
            handle_client_packet(&socket, &nat, src, data).await;
        } else {
            handle_remote_packet(&socket, &nat, src, data).await;
        }
    }
}

/// Client-encapsulated datagram: decode, record the NAT entry, forward bare
async fn handle_client_packet(
    socket: &UdpSocket,
    nat: &DashMap<SocketAddr, NatEntry>,
    client: SocketAddr,
    data: &[u8],
) {
    let datagram = match decode_client_packet(data) {
        Ok(d) => d,
        Err(e) => {
            trace!(%client, error = %e, "dropping malformed client datagram");
            return;
        }
    };
    let remote = match datagram.target.resolve().await {
        Ok(addr) => addr,
        Err(e) => {
            trace!(%client, target = %datagram.target, error = %e, "dropping unresolvable target");
            return;
        }
    };

    nat.entry(client)
        .and_modify(|entry| {
            entry.remote = remote;
            entry.touch();
        })
        .or_insert_with(|| NatEntry::new(remote));

    if let Err(e) = socket.send_to(&datagram.payload, remote).await {
        trace!(%client, %remote, error = %e, "forward to remote failed");
    }
}

/// Raw datagram: reverse-map by remote source, wrap, deliver to the client
async fn handle_remote_packet(
    socket: &UdpSocket,
    nat: &DashMap<SocketAddr, NatEntry>,
    remote: SocketAddr,
    data: &[u8],
) {
    let client = nat.iter_mut().find_map(|mut entry| {
        if entry.value().remote == remote {
            entry.value_mut().touch();
            Some(*entry.key())
        } else {
            None
        }
    });

    match client {
        Some(client) => {
            let reply = encode_reply(remote, data);
            if let Err(e) = socket.send_to(&reply, client).await {
                trace!(%client, %remote, error = %e, "reply to client failed");
            }
        }
        None => {
            trace!(%remote, "dropping datagram with no NAT entry");
        }
    }
}

/// Expire idle NAT entries on a fixed interval equal to the idle timeout
async fn gc_loop(nat: Arc<DashMap<SocketAddr, NatEntry>>, nat_timeout: Duration) {
    let mut interval = tokio::time::interval(nat_timeout);
    interval.tick().await; // the immediate first tick
    loop {
        interval.tick().await;
        // Counted inside the closure: the pump may insert concurrently, so a
        // before/after length comparison is not reliable
        let mut removed = 0usize;
        nat.retain(|_, entry| {
            if entry.is_expired(nat_timeout) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(removed, remaining = nat.len(), "expired idle NAT entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout as with_deadline;

    const IO_DEADLINE: Duration = Duration::from_secs(2);

    async fn udp_peer() -> (UdpSocket, SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    fn encapsulate(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
        encode_reply(target, payload).to_vec()
    }

    #[tokio::test]
    async fn test_relay_binds_ephemeral_port() {
        let relay = UdpRelay::start(
            "127.0.0.1".parse().unwrap(),
            0,
            None,
            DEFAULT_NAT_TIMEOUT,
        )
        .unwrap();
        assert_ne!(relay.local_addr().port(), 0);
        assert_eq!(relay.nat_entries(), 0);
        relay.stop();
    }

    #[tokio::test]
    async fn test_forward_and_reply_roundtrip() {
        let relay = UdpRelay::start(
            "127.0.0.1".parse().unwrap(),
            0,
            None,
            DEFAULT_NAT_TIMEOUT,
        )
        .unwrap();
        let relay_addr = relay.local_addr();

        let (client, _client_addr) = udp_peer().await;
        let (remote, remote_addr) = udp_peer().await;

        // Client -> relay (encapsulated) -> remote (bare)
        client
            .send_to(&encapsulate(remote_addr, b"ping"), relay_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 128];
        let (n, from) = with_deadline(IO_DEADLINE, remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, relay_addr);
        assert_eq!(relay.nat_entries(), 1);

        // Remote -> relay (bare) -> client (encapsulated)
        remote.send_to(b"pong", relay_addr).await.unwrap();
        let (n, from) = with_deadline(IO_DEADLINE, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, relay_addr);

        let pkt = decode_client_packet(&buf[..n]).unwrap();
        assert_eq!(pkt.target, crate::socks5::TargetAddr::Ip(remote_addr));
        assert_eq!(&pkt.payload[..], b"pong");

        relay.stop();
    }

    #[tokio::test]
    async fn test_nat_upsert_is_idempotent() {
        let relay = UdpRelay::start(
            "127.0.0.1".parse().unwrap(),
            0,
            None,
            DEFAULT_NAT_TIMEOUT,
        )
        .unwrap();
        let relay_addr = relay.local_addr();

        let (client, _) = udp_peer().await;
        let (remote, remote_addr) = udp_peer().await;

        let mut buf = [0u8; 64];
        for _ in 0..3 {
            client
                .send_to(&encapsulate(remote_addr, b"x"), relay_addr)
                .await
                .unwrap();
            with_deadline(IO_DEADLINE, remote.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(relay.nat_entries(), 1);
        relay.stop();
    }

    #[tokio::test]
    async fn test_gc_expires_idle_entries_and_drops_replies() {
        let relay = UdpRelay::start(
            "127.0.0.1".parse().unwrap(),
            0,
            None,
            Duration::from_millis(100),
        )
        .unwrap();
        let relay_addr = relay.local_addr();

        let (client, _) = udp_peer().await;
        let (remote, remote_addr) = udp_peer().await;

        let mut buf = [0u8; 64];
        client
            .send_to(&encapsulate(remote_addr, b"hello"), relay_addr)
            .await
            .unwrap();
        with_deadline(IO_DEADLINE, remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relay.nat_entries(), 1);

        // Idle past the timeout; the next GC pass removes the entry
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(relay.nat_entries(), 0);

        // Reply packets for the expired entry are dropped
        remote.send_to(b"late", relay_addr).await.unwrap();
        let got = with_deadline(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(got.is_err(), "expired entry must not route replies");

        relay.stop();
    }

    #[tokio::test]
    async fn test_gc_keeps_running_while_pump_inserts() {
        let relay = UdpRelay::start(
            "127.0.0.1".parse().unwrap(),
            0,
            None,
            Duration::from_millis(80),
        )
        .unwrap();
        let relay_addr = relay.local_addr();

        let (remote, remote_addr) = udp_peer().await;
        let mut buf = [0u8; 64];

        // One client goes idle immediately
        let (idle, _) = udp_peer().await;
        idle.send_to(&encapsulate(remote_addr, b"x"), relay_addr)
            .await
            .unwrap();
        with_deadline(IO_DEADLINE, remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // Another keeps inserting fresh activity across several GC passes
        let (busy, _) = udp_peer().await;
        for _ in 0..20 {
            busy.send_to(&encapsulate(remote_addr, b"y"), relay_addr)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The idle entry expired, the busy one survived, the GC is alive
        assert_eq!(relay.nat_entries(), 1);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(relay.nat_entries(), 0, "GC must keep expiring entries");

        relay.stop();
    }

    #[tokio::test]
    async fn test_stop_releases_the_port() {
        let relay = UdpRelay::start(
            "127.0.0.1".parse().unwrap(),
            0,
            None,
            DEFAULT_NAT_TIMEOUT,
        )
        .unwrap();
        let addr = relay.local_addr();

        relay.stop();
        // The aborted pump drops the socket on its next scheduler poll
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The relay value is still alive; only stop() freed the port
        let rebound = std::net::UdpSocket::bind(addr);
        assert!(rebound.is_ok(), "port must be free after stop()");
        assert_eq!(relay.nat_entries(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_raw_packet_is_dropped() {
        let relay = UdpRelay::start(
            "127.0.0.1".parse().unwrap(),
            0,
            None,
            DEFAULT_NAT_TIMEOUT,
        )
        .unwrap();
        let (stranger, _) = udp_peer().await;

        // Short raw datagram from an unknown peer: no entry, no effect
        stranger.send_to(b"???", relay.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.nat_entries(), 0);
        relay.stop();
    }

    #[tokio::test]
    async fn test_stop_clears_nat() {
        let relay = UdpRelay::start(
            "127.0.0.1".parse().unwrap(),
            0,
            None,
            DEFAULT_NAT_TIMEOUT,
        )
        .unwrap();
        let relay_addr = relay.local_addr();

        let (client, _) = udp_peer().await;
        let (remote, remote_addr) = udp_peer().await;
        let mut buf = [0u8; 64];
        client
            .send_to(&encapsulate(remote_addr, b"x"), relay_addr)
            .await
            .unwrap();
        with_deadline(IO_DEADLINE, remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        relay.stop();
        assert_eq!(relay.nat_entries(), 0);
        // stop() is idempotent
        relay.stop();
    }
}
