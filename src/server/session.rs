//! Per-connection SOCKS5 session state machine
//!
//! A session owns one accepted TCP connection and walks it through the
//! protocol phases in order: method negotiation, optional username/password
//! sub-negotiation, request parsing, then command dispatch. Every client
//! read during the handshake phases runs under the configured deadline, so
//! a silent client cannot hold a session slot forever.
//!
//! Outcome semantics: protocol-compliant refusals (no acceptable method,
//! bad credentials, unsupported command, failed outbound connect) are
//! normal completions that send the prescribed reply bytes and close.
//! Only malformed wire data, handshake timeouts, and transport failures
//! surface as errors.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::ServerConfig;
use super::error::{SessionError, SessionResult};
use crate::egress::OutboundNetworkProvider;
use crate::events::{EventBus, ProxyEvent};
use crate::guard::AccessGuard;
use crate::io::{pipe, PipeSummary};
use crate::socks5::{
    AddrError, Command, ProxyRequest, AUTH_METHOD_NONE, AUTH_METHOD_NO_ACCEPTABLE,
    AUTH_METHOD_PASSWORD, AUTH_PASSWORD_VERSION, AUTH_STATUS_FAILURE, AUTH_STATUS_SUCCESS,
    ATYP_IPV4, ATYP_IPV6, REPLY_COMMAND_NOT_SUPPORTED, REPLY_GENERAL_FAILURE, REPLY_SUCCEEDED,
    SOCKS5_VERSION,
};
use crate::udp::UdpRelay;

/// One accepted client connection being driven through the protocol
pub struct Socks5Session {
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    guard: Arc<AccessGuard>,
    provider: Arc<dyn OutboundNetworkProvider>,
    events: EventBus,
}

impl Socks5Session {
    /// Wrap an accepted connection
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<ServerConfig>,
        guard: Arc<AccessGuard>,
        provider: Arc<dyn OutboundNetworkProvider>,
        events: EventBus,
    ) -> Self {
        Self {
            stream,
            peer,
            config,
            guard,
            provider,
            events,
        }
    }

    /// Drive the session to completion
    ///
    /// Never panics and never leaks the connection; on error the cause is
    /// published as a [`ProxyEvent::SessionError`] and logged. Returns the
    /// byte totals moved by the bridge phase (zero for sessions that never
    /// reached it).
    pub async fn run(self) -> PipeSummary {
        let peer = self.peer;
        let events = self.events.clone();

        match self.process().await {
            Ok(summary) => {
                debug!(client = %peer, bytes = summary.total(), "session finished");
                summary
            }
            Err(e) => {
                warn!(client = %peer, error = %e, "session failed");
                events.emit(ProxyEvent::SessionError {
                    client: peer,
                    reason: e.to_string(),
                });
                PipeSummary::default()
            }
        }
    }

    async fn process(mut self) -> SessionResult<PipeSummary> {
        if !self.negotiate_method().await? {
            return Ok(PipeSummary::default());
        }

        let deadline = self.config.handshake_timeout();
        let request = timed(deadline, ProxyRequest::read_from(&mut self.stream)).await??;
        debug!(client = %self.peer, request = %request, "request received");

        match request.command {
            Command::Connect => self.handle_connect(request).await,
            Command::UdpAssociate if self.config.udp_enabled => {
                self.handle_udp_associate().await
            }
            other => {
                debug!(client = %self.peer, command = %other, "command not supported");
                self.send_reply(REPLY_COMMAND_NOT_SUPPORTED, zero_addr())
                    .await?;
                Ok(PipeSummary::default())
            }
        }
    }

    /// Method negotiation plus the optional RFC 1929 sub-negotiation
    ///
    /// Returns `false` when the session was refused with the prescribed
    /// reply bytes and must close without processing a request.
    async fn negotiate_method(&mut self) -> SessionResult<bool> {
        let deadline = self.config.handshake_timeout();

        let mut header = [0u8; 2];
        timed(deadline, self.stream.read_exact(&mut header)).await??;
        if header[0] != SOCKS5_VERSION {
            return Err(AddrError::BadVersion(header[0]).into());
        }

        let mut methods = vec![0u8; header[1] as usize];
        timed(deadline, self.stream.read_exact(&mut methods)).await??;

        let required = if self.config.auth.is_some() {
            AUTH_METHOD_PASSWORD
        } else {
            AUTH_METHOD_NONE
        };

        if !methods.contains(&required) {
            debug!(client = %self.peer, ?methods, "no acceptable authentication method");
            self.stream
                .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE])
                .await?;
            return Ok(false);
        }

        self.stream.write_all(&[SOCKS5_VERSION, required]).await?;

        if required == AUTH_METHOD_PASSWORD {
            return self.authenticate().await;
        }
        Ok(true)
    }

    /// RFC 1929 username/password sub-negotiation
    async fn authenticate(&mut self) -> SessionResult<bool> {
        let deadline = self.config.handshake_timeout();

        let version = timed(deadline, self.stream.read_u8()).await??;
        if version != AUTH_PASSWORD_VERSION {
            // Close without a status byte; the attempt still counts against
            // the source's failure window
            debug!(client = %self.peer, version, "bad auth sub-negotiation version");
            self.note_auth_failure();
            return Ok(false);
        }

        let username = timed(deadline, read_auth_field(&mut self.stream)).await??;
        let password = timed(deadline, read_auth_field(&mut self.stream)).await??;

        // validate() guarantees auth is present on this path
        let expected = self.config.auth.as_ref().ok_or_else(|| {
            SessionError::Io(std::io::Error::other("auth path without credentials"))
        })?;

        if username != expected.username.as_bytes() || password != expected.password.as_bytes() {
            return self.reject_credentials().await;
        }

        self.stream
            .write_all(&[AUTH_PASSWORD_VERSION, AUTH_STATUS_SUCCESS])
            .await?;
        Ok(true)
    }

    /// Send the auth-failure status and record the attempt on the throttle
    async fn reject_credentials(&mut self) -> SessionResult<bool> {
        info!(client = %self.peer, "authentication failed");
        let _ = self
            .stream
            .write_all(&[AUTH_PASSWORD_VERSION, AUTH_STATUS_FAILURE])
            .await;
        self.note_auth_failure();
        Ok(false)
    }

    /// Record a failed attempt; announce the block when this one trips it
    fn note_auth_failure(&self) {
        if self.guard.record_auth_failure(self.peer.ip()) {
            self.events.emit(ProxyEvent::TempBlockInstalled {
                ip: self.peer.ip(),
                minutes: self.config.temp_block_minutes,
            });
        }
    }

    /// CONNECT: dial the target over the egress provider and bridge
    async fn handle_connect(&mut self, request: ProxyRequest) -> SessionResult<PipeSummary> {
        let remote = match self
            .provider
            .connect_tcp(&request.target, self.config.connect_timeout())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                debug!(client = %self.peer, target = %request.target, error = %e,
                    "outbound connect failed");
                self.send_reply(REPLY_GENERAL_FAILURE, zero_addr()).await?;
                return Ok(PipeSummary::default());
            }
        };

        // BND.ADDR is the endpoint the client already talks to
        let bound = self.stream.local_addr()?;
        self.send_reply(REPLY_SUCCEEDED, bound).await?;

        self.events.emit(ProxyEvent::Bridging {
            client: self.peer,
            target: request.target.to_string(),
        });

        let stream = &mut self.stream;
        Ok(pipe(stream, remote).await)
    }

    /// UDP ASSOCIATE: stand up a relay for the lifetime of this connection
    async fn handle_udp_associate(&mut self) -> SessionResult<PipeSummary> {
        if !self.provider.is_available() {
            debug!(client = %self.peer, "no egress path for UDP association");
            self.send_reply(REPLY_COMMAND_NOT_SUPPORTED, zero_addr())
                .await?;
            return Ok(PipeSummary::default());
        }

        let bind_ip = self.stream.local_addr()?.ip();
        let relay = match UdpRelay::start(
            bind_ip,
            0,
            Some(self.provider.as_ref()),
            self.config.nat_timeout(),
        ) {
            Ok(relay) => relay,
            Err(e) => {
                debug!(client = %self.peer, error = %e, "UDP relay start failed");
                self.send_reply(REPLY_GENERAL_FAILURE, zero_addr()).await?;
                return Err(e.into());
            }
        };

        self.send_reply(REPLY_SUCCEEDED, relay.local_addr()).await?;
        self.events.emit(ProxyEvent::UdpReady(relay.local_addr()));

        // The association lives exactly as long as the control connection:
        // drain it until EOF, then tear the relay down.
        let mut drain = [0u8; 256];
        loop {
            match self.stream.read(&mut drain).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(client = %self.peer, error = %e, "control connection ended");
                    break;
                }
            }
        }

        relay.stop();
        Ok(PipeSummary::default())
    }

    /// Write a `VER REP RSV ATYP BND.ADDR BND.PORT` reply
    async fn send_reply(&mut self, code: u8, bound: SocketAddr) -> SessionResult<()> {
        let mut reply = Vec::with_capacity(22);
        reply.extend_from_slice(&[SOCKS5_VERSION, code, 0x00]);
        match bound.ip() {
            IpAddr::V4(v4) => {
                reply.push(ATYP_IPV4);
                reply.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                reply.push(ATYP_IPV6);
                reply.extend_from_slice(&v6.octets());
            }
        }
        reply.extend_from_slice(&bound.port().to_be_bytes());
        self.stream.write_all(&reply).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Socks5Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Session")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Run `fut` under the handshake deadline
async fn timed<F, T>(deadline: Duration, fut: F) -> SessionResult<T>
where
    F: std::future::Future<Output = T>,
{
    timeout(deadline, fut)
        .await
        .map_err(|_| SessionError::HandshakeTimeout)
}

/// Read one length-prefixed RFC 1929 field
async fn read_auth_field(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u8().await? as usize;
    let mut field = vec![0u8; len];
    stream.read_exact(&mut field).await?;
    Ok(field)
}

/// The all-zero IPv4 endpoint used in refusal replies
fn zero_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}
