//! PROXY protocol header construction.
//!
//! Conveys the original client endpoint to a backend behind the proxy.
//! Version 1 is the human-readable text form, version 2 the binary form.
//! Mixed address families degrade to the protocol's UNKNOWN/UNSPEC
//! encoding rather than lying about the client.

use std::net::SocketAddr;

/// Binary v2 signature.
const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocolVersion {
    V1,
    V2,
}

impl ProxyProtocolVersion {
    pub fn from_config(version: u8) -> Option<Self> {
        match version {
            1 => Some(ProxyProtocolVersion::V1),
            2 => Some(ProxyProtocolVersion::V2),
            _ => None,
        }
    }
}

/// Encode a PROXY protocol header for a proxied TCP connection.
///
/// `client` is the original source endpoint, `proxied` the endpoint the
/// client dialed (this proxy's listener side).
pub fn encode_header(
    version: ProxyProtocolVersion,
    client: SocketAddr,
    proxied: SocketAddr,
) -> Vec<u8> {
    match version {
        ProxyProtocolVersion::V1 => encode_v1(client, proxied),
        ProxyProtocolVersion::V2 => encode_v2(client, proxied),
    }
}

fn encode_v1(client: SocketAddr, proxied: SocketAddr) -> Vec<u8> {
    let line = match (client, proxied) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            src.ip(),
            dst.ip(),
            src.port(),
            dst.port()
        ),
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            src.ip(),
            dst.ip(),
            src.port(),
            dst.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_string(),
    };
    line.into_bytes()
}

fn encode_v2(client: SocketAddr, proxied: SocketAddr) -> Vec<u8> {
    let mut header = Vec::with_capacity(52);
    header.extend_from_slice(&V2_SIGNATURE);
    // Version 2, command PROXY.
    header.push(0x21);

    match (client, proxied) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            // AF_INET, STREAM.
            header.push(0x11);
            header.extend_from_slice(&12u16.to_be_bytes());
            header.extend_from_slice(&src.ip().octets());
            header.extend_from_slice(&dst.ip().octets());
            header.extend_from_slice(&src.port().to_be_bytes());
            header.extend_from_slice(&dst.port().to_be_bytes());
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
            // AF_INET6, STREAM.
            header.push(0x21);
            header.extend_from_slice(&36u16.to_be_bytes());
            header.extend_from_slice(&src.ip().octets());
            header.extend_from_slice(&dst.ip().octets());
            header.extend_from_slice(&src.port().to_be_bytes());
            header.extend_from_slice(&dst.port().to_be_bytes());
        }
        _ => {
            // AF_UNSPEC: the backend must skip address interpretation.
            header.push(0x00);
            header.extend_from_slice(&0u16.to_be_bytes());
        }
    }
    header
}
