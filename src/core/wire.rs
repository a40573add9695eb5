//! Wire-level primitives shared across layers.
//!
//! Socket addresses appear in three places with the same encoding: inside
//! the rendezvous artifact, in PORT_ROTATION_NOTIFY payloads, and in the
//! demo tooling. All integers are network byte order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family tag for an IPv4 endpoint.
const ADDR_TAG_V4: u8 = 0x04;

/// Address family tag for an IPv6 endpoint.
const ADDR_TAG_V6: u8 = 0x06;

/// Encode a socket address as `tag || ip || port_be16`.
///
/// IPv4 encodes to 7 bytes, IPv6 to 19.
pub fn encode_socket_addr(addr: SocketAddr, out: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(ADDR_TAG_V4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(ADDR_TAG_V6);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

/// Decode a socket address, returning the address and the number of bytes
/// consumed, or `None` if the input is truncated or the tag is unknown.
pub fn decode_socket_addr(data: &[u8]) -> Option<(SocketAddr, usize)> {
    let tag = *data.first()?;
    match tag {
        ADDR_TAG_V4 => {
            if data.len() < 7 {
                return None;
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&data[1..5]);
            let port = u16::from_be_bytes([data[5], data[6]]);
            Some((SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port), 7))
        }
        ADDR_TAG_V6 => {
            if data.len() < 19 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            let port = u16::from_be_bytes([data[17], data[18]]);
            Some((SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port), 19))
        }
        _ => None,
    }
}

/// Why an endpoint declared the session compromised.
///
/// Carried as a single byte in the COMPROMISED payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompromiseReason {
    /// No specific reason given.
    Unspecified = 0x00,
    /// Operator-initiated teardown.
    Operator = 0x01,
    /// The persistent-authentication-failure threshold was crossed.
    AuthFailures = 0x02,
    /// The rendezvous artifact is suspected leaked.
    ArtifactLeak = 0x03,
}

impl CompromiseReason {
    /// Parse from the wire byte. Unknown values map to `Unspecified`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::Operator,
            0x02 => Self::AuthFailures,
            0x03 => Self::ArtifactLeak,
            _ => Self::Unspecified,
        }
    }

    /// Wire byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Error codes carried in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// The local backend is unreachable or did not reply in time.
    BackendUnavailable = 0x01,
    /// Catch-all for malformed application traffic.
    BadRequest = 0x02,
}

impl ErrorCode {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::BackendUnavailable),
            0x02 => Some(Self::BadRequest),
            _ => None,
        }
    }

    /// Wire byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}
