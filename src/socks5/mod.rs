//! SOCKS5 protocol constants and wire types (RFC 1928, RFC 1929)
//!
//! Single source of truth for the protocol subset this server implements:
//! method negotiation, username/password sub-negotiation, CONNECT,
//! UDP ASSOCIATE, and the UDP encapsulation header.

mod addr;

pub use addr::{AddrError, Command, ProxyRequest, TargetAddr};

// ============================================================================
// Protocol Version
// ============================================================================

/// SOCKS5 protocol version (RFC 1928)
pub const SOCKS5_VERSION: u8 = 0x05;

// ============================================================================
// Authentication Methods (RFC 1928 Section 3)
// ============================================================================

/// No authentication required (0x00)
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// Username/password authentication - RFC 1929 (0x02)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;

/// No acceptable methods (0xFF) - server rejects all offered methods
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password auth sub-negotiation version (RFC 1929)
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// Sub-negotiation status: success
pub const AUTH_STATUS_SUCCESS: u8 = 0x00;

/// Sub-negotiation status: failure (any non-zero value closes the connection)
pub const AUTH_STATUS_FAILURE: u8 = 0x01;

// ============================================================================
// Commands (RFC 1928 Section 4)
// ============================================================================

/// CONNECT command (0x01) - establish TCP connection
pub const CMD_CONNECT: u8 = 0x01;

/// BIND command (0x02) - unsupported, always rejected
pub const CMD_BIND: u8 = 0x02;

/// UDP ASSOCIATE command (0x03) - establish UDP relay
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// ============================================================================
// Address Types (RFC 1928 Section 4)
// ============================================================================

/// IPv4 address (4 bytes)
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name (1 byte length + N bytes name)
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address (16 bytes)
pub const ATYP_IPV6: u8 = 0x04;

// ============================================================================
// Reply Codes (RFC 1928 Section 6)
// ============================================================================

/// Succeeded (0x00)
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// General SOCKS server failure (0x01)
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;

/// Command not supported (0x07)
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

// ============================================================================
// UDP Encapsulation Header (RFC 1928 Section 7)
// ============================================================================

/// Minimum UDP header size for IPv4: RSV(2) + FRAG(1) + ATYP(1) + IPv4(4) + PORT(2)
pub const UDP_HEADER_MIN_SIZE: usize = 10;

/// Offset of the FRAG field within the UDP envelope
pub const UDP_FRAG_OFFSET: usize = 2;

/// Convert a reply code to a human-readable message
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        _ => "unknown reply code",
    }
}
