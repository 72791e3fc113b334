//! Handshake sniffing.
//!
//! Reads exactly the handshake frame from a just-accepted client stream
//! and, when the declared intent is login or transfer, the LoginStart
//! frame as well. Nothing past the player name is decoded; trailing
//! LoginStart fields (UUID and signature data, which vary across protocol
//! versions) are tolerated and forwarded untouched inside the captured
//! bytes.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame::{decode_varint, FrameError, FrameReader};

/// Nominal hostname limit is 255; some modded clients stuff metadata into
/// the field, so tolerate a lot more before calling it malformed.
const MAX_SERVER_ADDRESS_LEN: usize = 4096;

/// Player names are at most 16 bytes on the wire.
const MAX_PLAYER_NAME_LEN: usize = 16;

/// First byte of a pre-1.7 server list ping.
const LEGACY_PING_BYTE: u8 = 0xfe;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected packet id {0}")]
    BadPacketId(i32),

    #[error("unsupported next state {0}")]
    UnsupportedNextState(i32),

    #[error("malformed string field")]
    MalformedString,

    #[error("stream ended mid-handshake")]
    Truncated,

    #[error(transparent)]
    Frame(FrameError),
}

impl From<FrameError> for HandshakeError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Truncated => HandshakeError::Truncated,
            other => HandshakeError::Frame(other),
        }
    }
}

/// Declared client intent from the handshake's next-state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
    /// Transfer intent (1.20.5+). Treated like login: the client sends
    /// LoginStart next.
    Transfer,
}

impl NextState {
    fn from_varint(value: i32) -> Option<Self> {
        match value {
            1 => Some(NextState::Status),
            2 => Some(NextState::Login),
            3 => Some(NextState::Transfer),
            _ => None,
        }
    }

    /// Whether the client will send LoginStart after the handshake.
    pub fn expects_login(self) -> bool {
        matches!(self, NextState::Login | NextState::Transfer)
    }
}

/// Decoded handshake fields.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// Result of sniffing a modern connection.
#[derive(Debug, Clone)]
pub struct Sniffed {
    pub handshake: Handshake,
    /// Player name from LoginStart, when the intent was login/transfer.
    pub player_name: Option<String>,
    /// Exact bytes consumed from the client, for verbatim replay.
    pub captured: Bytes,
}

/// What arrived on the wire.
#[derive(Debug, Clone)]
pub enum SniffResult {
    Handshake(Sniffed),
    /// Pre-1.7 server list ping. The hostname is only present for the 1.6
    /// `MC|PingHost` variant.
    LegacyPing { hostname: Option<String> },
}

/// Sniff the start of a client stream.
///
/// Reads the handshake frame (and LoginStart for login/transfer intent),
/// returning the decoded fields together with the raw bytes consumed. A
/// first byte of `0xFE` takes the legacy branch instead; no framing is
/// attempted there.
pub async fn sniff<R: AsyncRead + Unpin>(stream: &mut R) -> Result<SniffResult, HandshakeError> {
    let mut reader = FrameReader::new(&mut *stream);
    let first = reader.read_u8().await?;

    if first == LEGACY_PING_BYTE {
        drop(reader);
        let hostname = read_legacy_ping(stream).await;
        return Ok(SniffResult::LegacyPing { hostname });
    }

    let frame = reader.read_frame_continuing(first).await?;
    let handshake = parse_handshake_payload(&frame.payload)?;

    let player_name = if handshake.next_state.expects_login() {
        let login_frame = reader.read_frame().await?;
        Some(parse_login_start_payload(&login_frame.payload)?)
    } else {
        None
    };

    let captured = reader.take_captured();
    Ok(SniffResult::Handshake(Sniffed {
        handshake,
        player_name,
        captured,
    }))
}

fn parse_handshake_payload(payload: &[u8]) -> Result<Handshake, HandshakeError> {
    let mut cursor = payload;

    let packet_id = take_varint(&mut cursor)?;
    if packet_id != 0 {
        return Err(HandshakeError::BadPacketId(packet_id));
    }

    let protocol_version = take_varint(&mut cursor)?;
    let server_address = take_string(&mut cursor, MAX_SERVER_ADDRESS_LEN)?;
    let server_port = take_u16(&mut cursor)?;
    let next_state_raw = take_varint(&mut cursor)?;
    let next_state = NextState::from_varint(next_state_raw)
        .ok_or(HandshakeError::UnsupportedNextState(next_state_raw))?;

    Ok(Handshake {
        protocol_version,
        server_address,
        server_port,
        next_state,
    })
}

fn parse_login_start_payload(payload: &[u8]) -> Result<String, HandshakeError> {
    let mut cursor = payload;

    let packet_id = take_varint(&mut cursor)?;
    if packet_id != 0 {
        return Err(HandshakeError::BadPacketId(packet_id));
    }

    // Trailing fields (UUID, signature data) are version-dependent and
    // deliberately left unread.
    take_string(&mut cursor, MAX_PLAYER_NAME_LEN)
}

fn take_varint(cursor: &mut &[u8]) -> Result<i32, HandshakeError> {
    let (value, consumed) = decode_varint(cursor)?;
    *cursor = &cursor[consumed..];
    Ok(value)
}

fn take_string(cursor: &mut &[u8], max_len: usize) -> Result<String, HandshakeError> {
    let len = take_varint(cursor)?;
    if len < 0 || len as usize > max_len {
        return Err(HandshakeError::MalformedString);
    }
    let len = len as usize;
    if cursor.len() < len {
        return Err(HandshakeError::Truncated);
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    String::from_utf8(head.to_vec()).map_err(|_| HandshakeError::MalformedString)
}

fn take_u16(cursor: &mut &[u8]) -> Result<u16, HandshakeError> {
    if cursor.len() < 2 {
        return Err(HandshakeError::Truncated);
    }
    let value = u16::from_be_bytes([cursor[0], cursor[1]]);
    *cursor = &cursor[2..];
    Ok(value)
}

/// Read the rest of a legacy ping (first byte `0xFE` already consumed) and
/// try to extract the hostname of the 1.6 `MC|PingHost` variant.
///
/// Variants:
/// - Beta 1.8-1.3: `0xFE` only
/// - 1.4-1.5: `0xFE 0x01`
/// - 1.6: `0xFE 0x01 0xFA` + UTF-16BE plugin-message with the hostname
async fn read_legacy_ping<R: AsyncRead + Unpin>(stream: &mut R) -> Option<String> {
    let mut buf = [0u8; 512];
    let n = match stream.read(&mut buf).await {
        Ok(n) => n,
        Err(_) => return None,
    };
    parse_legacy_ping(&buf[..n])
}

/// Parse the legacy ping tail (bytes after the leading `0xFE`).
fn parse_legacy_ping(rest: &[u8]) -> Option<String> {
    // Beta variant: nothing follows the 0xFE.
    if rest.is_empty() || rest[0] != 0x01 {
        return None;
    }
    // 1.4-1.5 variant: 0xFE 0x01 and nothing else.
    if rest.len() < 2 || rest[1] != 0xfa {
        return None;
    }

    // 1.6 variant: 0xFA plugin message "MC|PingHost".
    let mut cursor = &rest[2..];
    let channel_chars = take_be_u16(&mut cursor)? as usize;
    let channel = take_utf16(&mut cursor, channel_chars)?;
    if channel != "MC|PingHost" {
        return None;
    }
    let _payload_len = take_be_u16(&mut cursor)?;
    let _protocol_version = take_be_u8(&mut cursor)?;
    let host_chars = take_be_u16(&mut cursor)? as usize;
    take_utf16(&mut cursor, host_chars)
}

fn take_be_u8(cursor: &mut &[u8]) -> Option<u8> {
    let (&head, tail) = cursor.split_first()?;
    *cursor = tail;
    Some(head)
}

fn take_be_u16(cursor: &mut &[u8]) -> Option<u16> {
    if cursor.len() < 2 {
        return None;
    }
    let value = u16::from_be_bytes([cursor[0], cursor[1]]);
    *cursor = &cursor[2..];
    Some(value)
}

fn take_utf16(cursor: &mut &[u8], chars: usize) -> Option<String> {
    let bytes = chars.checked_mul(2)?;
    if cursor.len() < bytes {
        return None;
    }
    let (head, tail) = cursor.split_at(bytes);
    *cursor = tail;
    let units: Vec<u16> = head
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{write_string, write_varint};

    /// Build a framed handshake packet the way a vanilla client would.
    pub(crate) fn handshake_frame(
        protocol_version: i32,
        server_address: &str,
        server_port: u16,
        next_state: i32,
    ) -> Vec<u8> {
        let mut payload = Vec::new();
        write_varint(&mut payload, 0x00);
        write_varint(&mut payload, protocol_version);
        write_string(&mut payload, server_address);
        payload.extend_from_slice(&server_port.to_be_bytes());
        write_varint(&mut payload, next_state);

        let mut frame = Vec::new();
        write_varint(&mut frame, payload.len() as i32);
        frame.extend_from_slice(&payload);
        frame
    }

    /// Build a framed LoginStart packet, optionally with 1.19+ trailing
    /// bytes after the name.
    pub(crate) fn login_start_frame(name: &str, trailing: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        write_varint(&mut payload, 0x00);
        write_string(&mut payload, name);
        payload.extend_from_slice(trailing);

        let mut frame = Vec::new();
        write_varint(&mut frame, payload.len() as i32);
        frame.extend_from_slice(&payload);
        frame
    }

    #[tokio::test]
    async fn test_sniff_status_handshake() {
        let wire = handshake_frame(767, "mc.example.com", 25565, 1);
        let mut stream = wire.as_slice();
        let result = sniff(&mut stream).await.unwrap();
        let SniffResult::Handshake(sniffed) = result else {
            panic!("expected handshake");
        };
        assert_eq!(sniffed.handshake.protocol_version, 767);
        assert_eq!(sniffed.handshake.server_address, "mc.example.com");
        assert_eq!(sniffed.handshake.server_port, 25565);
        assert_eq!(sniffed.handshake.next_state, NextState::Status);
        assert!(sniffed.player_name.is_none());
        assert_eq!(&sniffed.captured[..], wire.as_slice());
    }

    #[tokio::test]
    async fn test_sniff_login_captures_both_frames() {
        let mut wire = handshake_frame(763, "mc.example.com", 25565, 2);
        wire.extend_from_slice(&login_start_frame("Alice", &[]));
        let mut stream = wire.as_slice();
        let result = sniff(&mut stream).await.unwrap();
        let SniffResult::Handshake(sniffed) = result else {
            panic!("expected handshake");
        };
        assert_eq!(sniffed.handshake.next_state, NextState::Login);
        assert_eq!(sniffed.player_name.as_deref(), Some("Alice"));
        assert_eq!(&sniffed.captured[..], wire.as_slice());
    }

    #[tokio::test]
    async fn test_sniff_login_tolerates_trailing_fields() {
        // 1.20.2+ LoginStart carries a 16-byte UUID after the name.
        let uuid = [0x11u8; 16];
        let mut wire = handshake_frame(764, "mc.example.com", 25565, 2);
        wire.extend_from_slice(&login_start_frame("Bob", &uuid));
        let mut stream = wire.as_slice();
        let SniffResult::Handshake(sniffed) = sniff(&mut stream).await.unwrap() else {
            panic!("expected handshake");
        };
        assert_eq!(sniffed.player_name.as_deref(), Some("Bob"));
        // The trailing UUID bytes travel inside the captured frame.
        assert_eq!(&sniffed.captured[..], wire.as_slice());
    }

    #[tokio::test]
    async fn test_sniff_transfer_intent_reads_login_start() {
        let mut wire = handshake_frame(766, "mc.example.com", 25565, 3);
        wire.extend_from_slice(&login_start_frame("Carol", &[]));
        let mut stream = wire.as_slice();
        let SniffResult::Handshake(sniffed) = sniff(&mut stream).await.unwrap() else {
            panic!("expected handshake");
        };
        assert_eq!(sniffed.handshake.next_state, NextState::Transfer);
        assert_eq!(sniffed.player_name.as_deref(), Some("Carol"));
    }

    #[tokio::test]
    async fn test_sniff_bad_packet_id() {
        let mut payload = Vec::new();
        write_varint(&mut payload, 0x05);
        let mut wire = Vec::new();
        write_varint(&mut wire, payload.len() as i32);
        wire.extend_from_slice(&payload);
        let mut stream = wire.as_slice();
        assert!(matches!(
            sniff(&mut stream).await,
            Err(HandshakeError::BadPacketId(5))
        ));
    }

    #[tokio::test]
    async fn test_sniff_unsupported_next_state() {
        let wire = handshake_frame(767, "mc.example.com", 25565, 7);
        let mut stream = wire.as_slice();
        assert!(matches!(
            sniff(&mut stream).await,
            Err(HandshakeError::UnsupportedNextState(7))
        ));
    }

    #[tokio::test]
    async fn test_sniff_truncated_handshake() {
        let wire = handshake_frame(767, "mc.example.com", 25565, 2);
        // Handshake arrives whole but LoginStart never does.
        let mut stream = wire.as_slice();
        assert!(matches!(
            sniff(&mut stream).await,
            Err(HandshakeError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_sniff_oversized_hostname_rejected() {
        let long = "h".repeat(MAX_SERVER_ADDRESS_LEN + 1);
        let wire = handshake_frame(767, &long, 25565, 1);
        let mut stream = wire.as_slice();
        assert!(matches!(
            sniff(&mut stream).await,
            Err(HandshakeError::MalformedString)
        ));
    }

    #[tokio::test]
    async fn test_sniff_legacy_beta_ping() {
        let wire = [0xfeu8];
        let mut stream = wire.as_slice();
        let result = sniff(&mut stream).await.unwrap();
        assert!(matches!(
            result,
            SniffResult::LegacyPing { hostname: None }
        ));
    }

    #[tokio::test]
    async fn test_sniff_legacy_pinghost_hostname() {
        let mut wire = vec![0xfe, 0x01, 0xfa];
        let channel: Vec<u8> = "MC|PingHost"
            .encode_utf16()
            .flat_map(|u| u.to_be_bytes())
            .collect();
        wire.extend_from_slice(&(11u16).to_be_bytes());
        wire.extend_from_slice(&channel);
        let host: Vec<u8> = "mc.example.com"
            .encode_utf16()
            .flat_map(|u| u.to_be_bytes())
            .collect();
        let payload_len = 1 + 2 + host.len() + 4;
        wire.extend_from_slice(&(payload_len as u16).to_be_bytes());
        wire.push(74);
        wire.extend_from_slice(&(14u16).to_be_bytes());
        wire.extend_from_slice(&host);
        wire.extend_from_slice(&25565u32.to_be_bytes());

        let mut stream = wire.as_slice();
        let SniffResult::LegacyPing { hostname } = sniff(&mut stream).await.unwrap() else {
            panic!("expected legacy ping");
        };
        assert_eq!(hostname.as_deref(), Some("mc.example.com"));
    }

    #[test]
    fn test_parse_legacy_garbage_is_none() {
        assert!(parse_legacy_ping(&[]).is_none());
        assert!(parse_legacy_ping(&[0x01]).is_none());
        assert!(parse_legacy_ping(&[0x01, 0xfa, 0x00]).is_none());
        assert!(parse_legacy_ping(&[0xde, 0xad, 0xbe, 0xef]).is_none());
    }
}
