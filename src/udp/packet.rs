//! SOCKS5 UDP envelope codec (RFC 1928 Section 7)
//!
//! Both directions use the same envelope:
//! `RSV(2)=0x0000 FRAG(1) ATYP(1) DST.ADDR(4|16|1+N) DST.PORT(2) DATA`.
//! FRAG must be zero; fragmentation is unsupported and such datagrams are
//! rejected.
//!
//! Classification of an arriving datagram as client-encapsulated versus a
//! raw remote reply is a shape heuristic (length and FRAG byte), not an
//! authenticated distinction. A malicious UDP peer can craft packets that
//! are misclassified; this is a known, deliberate limitation.

use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::socks5::{
    TargetAddr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, UDP_FRAG_OFFSET, UDP_HEADER_MIN_SIZE,
};

/// Errors raised while decoding a client-encapsulated datagram
#[derive(Debug, Error)]
pub enum PacketError {
    /// Datagram shorter than the minimum envelope
    #[error("datagram too short for SOCKS5 UDP header ({0} bytes)")]
    TooShort(usize),

    /// Non-zero FRAG field
    #[error("fragmented datagrams unsupported (FRAG={0:#04x})")]
    Fragmented(u8),

    /// Unknown ATYP value
    #[error("unknown address type: {0:#04x}")]
    UnknownAddressType(u8),

    /// Domain name was not valid UTF-8
    #[error("domain name is not valid UTF-8")]
    BadDomain,

    /// Envelope truncated mid-field
    #[error("truncated SOCKS5 UDP header")]
    Truncated,
}

/// A decoded client-originated datagram
#[derive(Debug, Clone)]
pub struct ClientDatagram {
    /// Destination the client addressed
    pub target: TargetAddr,
    /// Bare payload to forward
    pub payload: Bytes,
}

/// Heuristic: does this datagram look like a client-encapsulated packet?
///
/// True when the datagram is at least the minimum envelope length and its
/// FRAG byte is zero. See the module docs for why this is only a heuristic.
#[must_use]
pub fn looks_like_client_packet(data: &[u8]) -> bool {
    data.len() >= UDP_HEADER_MIN_SIZE && data[UDP_FRAG_OFFSET] == 0x00
}

/// Decode a client-encapsulated datagram
///
/// # Errors
///
/// Returns `PacketError` for short, fragmented, or malformed envelopes.
pub fn decode_client_packet(data: &[u8]) -> Result<ClientDatagram, PacketError> {
    if data.len() < UDP_HEADER_MIN_SIZE {
        return Err(PacketError::TooShort(data.len()));
    }

    let mut buf = data;
    buf.advance(2); // RSV, ignored on input

    let frag = buf.get_u8();
    if frag != 0 {
        return Err(PacketError::Fragmented(frag));
    }

    let atyp = buf.get_u8();
    let target = match atyp {
        ATYP_IPV4 => {
            if buf.remaining() < 6 {
                return Err(PacketError::Truncated);
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            TargetAddr::Ip(SocketAddr::new(IpAddr::from(octets), port))
        }
        ATYP_DOMAIN => {
            if buf.remaining() < 1 {
                return Err(PacketError::Truncated);
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len + 2 {
                return Err(PacketError::Truncated);
            }
            let name = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| PacketError::BadDomain)?;
            buf.advance(len);
            let port = buf.get_u16();
            TargetAddr::Domain(name, port)
        }
        ATYP_IPV6 => {
            if buf.remaining() < 18 {
                return Err(PacketError::Truncated);
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            TargetAddr::Ip(SocketAddr::new(IpAddr::from(octets), port))
        }
        other => return Err(PacketError::UnknownAddressType(other)),
    };

    Ok(ClientDatagram {
        target,
        payload: Bytes::copy_from_slice(buf),
    })
}

/// Wrap a remote reply in the SOCKS5 UDP envelope for delivery to a client
#[must_use]
pub fn encode_reply(remote: SocketAddr, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_MIN_SIZE + 12 + payload.len());
    buf.put_u16(0x0000); // RSV
    buf.put_u8(0x00); // FRAG
    match remote.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.octets());
        }
    }
    buf.put_u16(remote.port());
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        // 10 bytes, FRAG=0: client shaped
        let client = [0, 0, 0, 0x01, 127, 0, 0, 1, 0x04, 0x38];
        assert!(looks_like_client_packet(&client));

        // Too short
        assert!(!looks_like_client_packet(&[0, 0, 0, 1, 2]));

        // FRAG set: treated as a raw remote packet
        let fragged = [0, 0, 1, 0x01, 127, 0, 0, 1, 0x04, 0x38];
        assert!(!looks_like_client_packet(&fragged));
    }

    #[test]
    fn test_decode_ipv4() {
        let mut wire = vec![0, 0, 0, 0x01, 8, 8, 8, 8, 0x00, 0x35];
        wire.extend_from_slice(b"dns-query");
        let pkt = decode_client_packet(&wire).unwrap();

        assert_eq!(pkt.target, TargetAddr::Ip("8.8.8.8:53".parse().unwrap()));
        assert_eq!(&pkt.payload[..], b"dns-query");
    }

    #[test]
    fn test_decode_domain() {
        let mut wire = vec![0, 0, 0, 0x03, 0x09];
        wire.extend_from_slice(b"localhost");
        wire.extend_from_slice(&[0x00, 0x35]);
        wire.extend_from_slice(b"x");
        let pkt = decode_client_packet(&wire).unwrap();

        assert_eq!(pkt.target, TargetAddr::Domain("localhost".into(), 53));
        assert_eq!(&pkt.payload[..], b"x");
    }

    #[test]
    fn test_decode_rejects_fragment() {
        let wire = [0, 0, 2, 0x01, 8, 8, 8, 8, 0x00, 0x35];
        assert!(matches!(
            decode_client_packet(&wire),
            Err(PacketError::Fragmented(2))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let wire = [0, 0, 0, 0x01, 8, 8];
        assert!(decode_client_packet(&wire).is_err());

        let wire = [0, 0, 0, 0x03, 0x20, b'a', b'b'];
        assert!(matches!(
            decode_client_packet(&wire),
            Err(PacketError::Truncated)
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_atyp() {
        let wire = [0, 0, 0, 0x09, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_client_packet(&wire),
            Err(PacketError::UnknownAddressType(0x09))
        ));
    }

    #[test]
    fn test_encode_reply_ipv4() {
        let reply = encode_reply("1.2.3.4:7777".parse().unwrap(), b"pong");
        assert_eq!(&reply[..4], &[0, 0, 0, 0x01]);
        assert_eq!(&reply[4..8], &[1, 2, 3, 4]);
        assert_eq!(&reply[8..10], &7777u16.to_be_bytes());
        assert_eq!(&reply[10..], b"pong");
        // A well-formed reply is itself client-shaped; that is the heuristic's
        // blind spot and exactly why it stays a heuristic
        assert!(looks_like_client_packet(&reply));
    }

    #[test]
    fn test_encode_reply_ipv6() {
        let reply = encode_reply("[::1]:53".parse().unwrap(), b"");
        assert_eq!(reply[3], ATYP_IPV6);
        assert_eq!(reply.len(), 2 + 1 + 1 + 16 + 2);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let remote: SocketAddr = "9.9.9.9:443".parse().unwrap();
        let wire = encode_reply(remote, b"payload");
        let pkt = decode_client_packet(&wire).unwrap();
        assert_eq!(pkt.target, TargetAddr::Ip(remote));
        assert_eq!(&pkt.payload[..], b"payload");
    }
}
