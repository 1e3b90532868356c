//! Accept loop and connection admission
//!
//! The listener owns the TCP accept socket and performs admission control
//! before any protocol bytes are exchanged: allow/deny lists first, then
//! the temporary-block table, then the session cap. A rejected connection
//! is closed silently; the refusal is visible only as a [`ProxyEvent`].
//!
//! The session-cap slot is claimed in the accept loop, before the session
//! task is spawned, so the number of admitted sessions can never exceed
//! the cap no matter how the spawned tasks interleave.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::config::ServerConfig;
use super::error::{ServerError, ServerResult};
use super::session::Socks5Session;
use super::stats::ServerStats;
use crate::egress::OutboundNetworkProvider;
use crate::events::{EventBus, ProxyEvent};
use crate::guard::AccessGuard;

/// Accept queue depth for the listen socket
const LISTEN_BACKLOG: i32 = 1024;

/// A SOCKS5 server: one listen socket, many concurrent sessions
pub struct Socks5Server {
    config: Arc<ServerConfig>,
    guard: Arc<AccessGuard>,
    provider: Arc<dyn OutboundNetworkProvider>,
    events: EventBus,
    stats: Arc<ServerStats>,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Socks5Server {
    /// Create a server from a validated configuration and an egress provider
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` if the configuration fails validation.
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn OutboundNetworkProvider>,
    ) -> ServerResult<Self> {
        config.validate()?;

        let guard = Arc::new(AccessGuard::new(
            config.allow.clone(),
            config.deny.clone(),
            config.auth_fail_threshold,
            config.temp_block(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            guard,
            provider,
            events: EventBus::new(),
            stats: Arc::new(ServerStats::new()),
            shutdown_tx,
            local_addr: Mutex::new(None),
        })
    }

    /// Bind the listen socket and run the accept loop until shutdown
    ///
    /// The actual bound address (relevant when the configured port is 0)
    /// is available through [`local_addr`](Self::local_addr) once this
    /// method has emitted [`ProxyEvent::Listening`].
    ///
    /// # Errors
    ///
    /// Returns `ServerError::BindFailed` if the socket cannot be bound;
    /// accept-loop transport errors are logged and retried, not returned.
    pub async fn serve(&self) -> ServerResult<()> {
        let listener = self.bind()?;
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::bind_failed(self.config.listen, e.to_string()))?;
        *self.local_addr.lock() = Some(local);

        info!(listen = %local, max_sessions = self.config.max_sessions, "server started");
        self.events.emit(ProxyEvent::Listening(local));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer, &mut sessions),
                        Err(e) => {
                            // Transient accept failures (EMFILE etc) must not
                            // take the server down
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        if !e.is_cancelled() {
                            warn!(error = %e, "session task panicked");
                        }
                    }
                }
            }
        }

        sessions.shutdown().await;
        info!(listen = %local, "server stopped");
        self.events.emit(ProxyEvent::Stopped);
        Ok(())
    }

    /// Request the accept loop to stop; idempotent
    ///
    /// In-flight sessions are aborted as `serve()` winds down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// The bound listen address, once `serve()` has bound it
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Aggregate statistics handle
    #[must_use]
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Subscribe to server events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// The admission policy handle
    #[must_use]
    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    fn bind(&self) -> ServerResult<TcpListener> {
        let addr = self.config.listen;
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let bind = || -> std::io::Result<TcpListener> {
            let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
            socket.set_reuse_address(true)?;
            socket.bind(&addr.into())?;
            socket.listen(LISTEN_BACKLOG)?;
            socket.set_nonblocking(true)?;
            TcpListener::from_std(socket.into())
        };
        bind().map_err(|e| ServerError::bind_failed(addr, e.to_string()))
    }

    /// Evaluate admission policy and either spawn a session or drop silently
    fn admit(&self, stream: TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        let ip = peer.ip();

        if !self.guard.is_allowed(ip) {
            debug!(client = %peer, "rejected by ACL");
            self.events.emit(ProxyEvent::AclRejected(ip));
            return;
        }
        if self.guard.is_temporarily_blocked(ip) {
            debug!(client = %peer, "rejected: temporarily blocked");
            self.events.emit(ProxyEvent::TempBlockRejected(ip));
            return;
        }
        if self.stats.active_sessions() >= self.config.max_sessions as u64 {
            debug!(client = %peer, "rejected: session cap reached");
            self.events
                .emit(ProxyEvent::SessionCapReached(self.config.max_sessions));
            return;
        }

        let _ = stream.set_nodelay(true);

        // Claim the slot here so the cap holds even before the task runs
        let mut slot = self.stats.begin_session();
        let session = Socks5Session::new(
            stream,
            peer,
            Arc::clone(&self.config),
            Arc::clone(&self.guard),
            Arc::clone(&self.provider),
            self.events.clone(),
        );

        sessions.spawn(async move {
            let summary = session.run().await;
            slot.record_bytes(summary.total());
        });
    }
}

impl std::fmt::Debug for Socks5Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Server")
            .field("listen", &self.config.listen)
            .field("local_addr", &self.local_addr())
            .field("max_sessions", &self.config.max_sessions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::SystemNetworkProvider;
    use crate::guard::parse_rules;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const DEADLINE: Duration = Duration::from_secs(2);

    async fn start_server(config: ServerConfig) -> (Arc<Socks5Server>, SocketAddr) {
        let server = Arc::new(
            Socks5Server::new(config, Arc::new(SystemNetworkProvider)).unwrap(),
        );
        let mut events = server.subscribe_events();
        let serve = Arc::clone(&server);
        tokio::spawn(async move { serve.serve().await });

        // Wait for the Listening event so local_addr is populated
        loop {
            if let ProxyEvent::Listening(addr) = events.recv().await.unwrap() {
                return (server, addr);
            }
        }
    }

    fn ephemeral_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn test_binds_and_reports_local_addr() {
        let (server, addr) = start_server(ephemeral_config()).await;
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let config = ephemeral_config().with_max_sessions(0);
        assert!(Socks5Server::new(config, Arc::new(SystemNetworkProvider)).is_err());
    }

    #[tokio::test]
    async fn test_denied_source_closed_without_bytes() {
        let config = ephemeral_config().with_deny_list(parse_rules(&["127.0.0.0/8"]).unwrap());
        let (server, addr) = start_server(config).await;
        let mut events = server.subscribe_events();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        // The server sends nothing and closes
        let mut buf = [0u8; 1];
        let n = timeout(DEADLINE, conn.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        let event = timeout(DEADLINE, events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, ProxyEvent::AclRejected(_)));
        assert_eq!(server.stats().snapshot().total_sessions, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_session_cap_enforced() {
        let (server, addr) = start_server(ephemeral_config().with_max_sessions(1)).await;
        let mut events = server.subscribe_events();

        // First connection occupies the only slot (handshake left pending)
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut resp = [0u8; 2];
        timeout(DEADLINE, first.read_exact(&mut resp))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.stats().active_sessions(), 1);

        // Second connection is dropped without any reply
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(DEADLINE, second.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        let mut saw_cap = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ProxyEvent::SessionCapReached(1)) {
                saw_cap = true;
            }
        }
        assert!(saw_cap);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (server, addr) = start_server(ephemeral_config()).await;
        let mut events = server.subscribe_events();

        server.shutdown();
        let event = timeout(DEADLINE, async {
            loop {
                if let ProxyEvent::Stopped = events.recv().await.unwrap() {
                    break ProxyEvent::Stopped;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, ProxyEvent::Stopped);

        // Repeated shutdown is harmless
        server.shutdown();
        // New connections are refused or immediately closed
        if let Ok(mut conn) = TcpStream::connect(addr).await {
            let mut buf = [0u8; 1];
            let n = timeout(DEADLINE, conn.read(&mut buf)).await.unwrap().unwrap_or(0);
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_bytes_accumulate_after_session_end() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            while let Ok(n) = conn.read(&mut buf).await {
                if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });

        let (server, addr) = start_server(ephemeral_config()).await;
        let mut stats_rx = server.stats().subscribe();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut resp = [0u8; 2];
        conn.read_exact(&mut resp).await.unwrap();

        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&echo_addr.port().to_be_bytes());
        conn.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        conn.write_all(b"12345").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        drop(conn);

        // Totals appear only once the session has fully terminated
        timeout(DEADLINE, async {
            loop {
                stats_rx.changed().await.unwrap();
                let snap = *stats_rx.borrow();
                if snap.active_sessions == 0 && snap.total_bytes > 0 {
                    break snap;
                }
            }
        })
        .await
        .map(|snap| assert_eq!(snap.total_bytes, 10))
        .unwrap();

        server.shutdown();
    }
}
