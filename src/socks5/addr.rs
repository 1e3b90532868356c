//! SOCKS5 request and address parsing
//!
//! Implements the request wire format from RFC 1928 Section 4:
//! `VER CMD RSV ATYP DST.ADDR DST.PORT`. Addresses are 4 raw bytes (IPv4),
//! a length-prefixed domain name, or 16 raw bytes (IPv6); the port is
//! big-endian. Any malformed header or short read is a protocol violation
//! and terminates the session without a reply.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_BIND, CMD_CONNECT, CMD_UDP_ASSOCIATE, SOCKS5_VERSION,
};

/// Errors raised while parsing SOCKS5 addresses and requests
#[derive(Debug, Error)]
pub enum AddrError {
    /// Version byte was not 0x05
    #[error("unsupported SOCKS version: {0:#04x}")]
    BadVersion(u8),

    /// Reserved byte was not 0x00
    #[error("non-zero reserved byte: {0:#04x}")]
    BadReserved(u8),

    /// Unknown ATYP value
    #[error("unknown address type: {0:#04x}")]
    UnknownAddressType(u8),

    /// Domain name was not valid UTF-8
    #[error("domain name is not valid UTF-8")]
    BadDomain,

    /// Short read or transport failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A parsed SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// CONNECT (0x01)
    Connect,
    /// BIND (0x02) - never serviced, replied with "command not supported"
    Bind,
    /// UDP ASSOCIATE (0x03)
    UdpAssociate,
    /// Any other command byte
    Other(u8),
}

impl Command {
    /// Decode a command byte
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        match b {
            CMD_CONNECT => Self::Connect,
            CMD_BIND => Self::Bind,
            CMD_UDP_ASSOCIATE => Self::UdpAssociate,
            other => Self::Other(other),
        }
    }

    /// The wire value of this command
    #[must_use]
    pub const fn as_byte(&self) -> u8 {
        match self {
            Self::Connect => CMD_CONNECT,
            Self::Bind => CMD_BIND,
            Self::UdpAssociate => CMD_UDP_ASSOCIATE,
            Self::Other(b) => *b,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "CONNECT"),
            Self::Bind => write!(f, "BIND"),
            Self::UdpAssociate => write!(f, "UDP-ASSOCIATE"),
            Self::Other(b) => write!(f, "UNKNOWN({b:#04x})"),
        }
    }
}

/// Target address of a proxy request
///
/// Domains are kept unresolved until the moment a connection or datagram
/// actually needs a socket address; resolution is the egress provider's or
/// relay's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Literal IPv4/IPv6 address and port
    Ip(SocketAddr),
    /// Domain name and port
    Domain(String, u16),
}

impl TargetAddr {
    /// Target port
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(sa) => sa.port(),
            Self::Domain(_, port) => *port,
        }
    }

    /// Host component as text (IP literal or domain name)
    #[must_use]
    pub fn host(&self) -> String {
        match self {
            Self::Ip(sa) => sa.ip().to_string(),
            Self::Domain(name, _) => name.clone(),
        }
    }

    /// Resolve to a socket address, performing a DNS lookup for domains
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails or yields no addresses.
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Ip(sa) => Ok(*sa),
            Self::Domain(name, port) => {
                tokio::net::lookup_host((name.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("no addresses for {name}"),
                        )
                    })
            }
        }
    }

    /// Read an `ATYP DST.ADDR DST.PORT` sequence from the wire
    ///
    /// # Errors
    ///
    /// Returns `AddrError` on unknown address types, bad UTF-8 domains,
    /// or short reads.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, AddrError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        Self::read_tail(reader, atyp).await
    }

    /// Read `DST.ADDR DST.PORT` given an already-consumed ATYP byte
    pub(crate) async fn read_tail<R>(reader: &mut R, atyp: u8) -> Result<Self, AddrError>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(Self::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let name = String::from_utf8(name).map_err(|_| AddrError::BadDomain)?;
                let port = reader.read_u16().await?;
                Ok(Self::Domain(name, port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(Self::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            other => Err(AddrError::UnknownAddressType(other)),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(sa) => write!(f, "{sa}"),
            Self::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(sa: SocketAddr) -> Self {
        Self::Ip(sa)
    }
}

/// A parsed SOCKS5 request, immutable once read off the wire
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Requested command
    pub command: Command,
    /// Target host and port
    pub target: TargetAddr,
}

impl ProxyRequest {
    /// Read a full request (`VER CMD RSV ATYP ADDR PORT`) from the wire
    ///
    /// # Errors
    ///
    /// Returns `AddrError` on a bad version byte, non-zero reserved byte,
    /// unknown address type, or short read.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, AddrError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(AddrError::BadVersion(header[0]));
        }
        if header[2] != 0x00 {
            return Err(AddrError::BadReserved(header[2]));
        }

        let command = Command::from_byte(header[1]);
        let target = TargetAddr::read_tail(reader, header[3]).await?;

        Ok(Self { command, target })
    }
}

impl fmt::Display for ProxyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.command, self.target)
    }
}
