//! Minimal STUN binding probe (RFC 5389).
//!
//! Only the binding request/response with XOR-MAPPED-ADDRESS (plus the
//! legacy MAPPED-ADDRESS fallback) is implemented: enough to learn the
//! public mapping of a local socket through an operator-supplied
//! reflector. No MESSAGE-INTEGRITY, no TURN.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

/// STUN magic cookie.
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Binding request message type.
const BINDING_REQUEST: u16 = 0x0001;

/// Binding response message type.
const BINDING_RESPONSE: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute.
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Legacy MAPPED-ADDRESS attribute.
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

/// STUN header size.
const HEADER_SIZE: usize = 20;

/// Build a binding request with a random transaction id.
pub(crate) fn build_binding_request() -> ([u8; HEADER_SIZE], [u8; 12]) {
    let mut transaction_id = [0u8; 12];
    for byte in &mut transaction_id {
        *byte = rand::random();
    }

    let mut message = [0u8; HEADER_SIZE];
    message[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Length stays zero: no attributes.
    message[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    message[8..].copy_from_slice(&transaction_id);
    (message, transaction_id)
}

/// Build a binding response carrying `mapped` as XOR-MAPPED-ADDRESS.
/// Used by the loopback reflector in tests and the demo tooling.
pub fn build_binding_response(transaction_id: &[u8; 12], mapped: SocketAddr) -> Vec<u8> {
    let xored = xor_address(mapped, transaction_id);
    let (family, ip_bytes): (u8, Vec<u8>) = match xored.ip() {
        IpAddr::V4(ip) => (0x01, ip.octets().to_vec()),
        IpAddr::V6(ip) => (0x02, ip.octets().to_vec()),
    };

    let attr_value_len = 4 + ip_bytes.len();
    let mut message = Vec::with_capacity(HEADER_SIZE + 4 + attr_value_len);
    message.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    message.extend_from_slice(&((4 + attr_value_len) as u16).to_be_bytes());
    message.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    message.extend_from_slice(transaction_id);
    message.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    message.extend_from_slice(&(attr_value_len as u16).to_be_bytes());
    message.push(0x00);
    message.push(family);
    message.extend_from_slice(&xored.port().to_be_bytes());
    message.extend_from_slice(&ip_bytes);
    message
}

/// XOR an address with the magic cookie (and transaction id for v6).
/// The operation is an involution: applying it twice restores the
/// original address.
fn xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match addr.ip() {
        IpAddr::V4(ip) => {
            let raw = u32::from(ip) ^ MAGIC_COOKIE;
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            for (byte, m) in octets.iter_mut().zip(mask) {
                *byte ^= m;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    SocketAddr::new(ip, port)
}

/// Parse a binding response for our transaction id.
pub(crate) fn parse_binding_response(
    data: &[u8],
    transaction_id: &[u8; 12],
) -> Option<SocketAddr> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let message_type = u16::from_be_bytes([data[0], data[1]]);
    if message_type != BINDING_RESPONSE {
        return None;
    }
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE || &data[8..20] != transaction_id {
        return None;
    }

    let mut cursor = HEADER_SIZE;
    while cursor + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[cursor], data[cursor + 1]]);
        let attr_len = u16::from_be_bytes([data[cursor + 2], data[cursor + 3]]) as usize;
        let value_start = cursor + 4;
        let value_end = value_start.checked_add(attr_len)?;
        if value_end > data.len() {
            return None;
        }
        let value = &data[value_start..value_end];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                let xored = parse_address_value(value)?;
                return Some(xor_address(xored, transaction_id));
            }
            ATTR_MAPPED_ADDRESS => {
                return parse_address_value(value);
            }
            _ => {}
        }
        // Attributes are padded to 4-byte boundaries.
        cursor = value_end + (4 - attr_len % 4) % 4;
    }
    None
}

fn parse_address_value(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]);
    match family {
        0x01 if value.len() >= 8 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Ask `reflector` for this socket's public mapping.
///
/// Returns `None` on timeout or a malformed answer; a failed probe never
/// blocks the punch.
pub async fn query_mapped_address(
    socket: &UdpSocket,
    reflector: SocketAddr,
    timeout: Duration,
) -> Option<SocketAddr> {
    let (request, transaction_id) = build_binding_request();
    if let Err(e) = socket.send_to(&request, reflector).await {
        debug!(%reflector, error = %e, "stun probe send failed");
        return None;
    }

    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        match recv {
            Ok(Ok((len, from))) => {
                if from != reflector {
                    continue;
                }
                match parse_binding_response(&buf[..len], &transaction_id) {
                    Some(mapped) => return Some(mapped),
                    None => continue,
                }
            }
            Ok(Err(e)) => {
                debug!(%reflector, error = %e, "stun probe recv failed");
                return None;
            }
            Err(_) => {
                debug!(%reflector, "stun probe timed out");
                return None;
            }
        }
    }
}
