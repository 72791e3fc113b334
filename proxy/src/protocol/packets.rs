//! Clientbound packet construction.
//!
//! The proxy speaks to clients in exactly one situation: rejecting a login
//! before any backend is dialed. Minecraft expects a JSON chat component as
//! the disconnect reason.

use serde_json::json;

use super::frame::{write_string, write_varint};

/// Build a complete packet: length prefix, packet id, payload.
fn build_packet(packet_id: i32, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 5);
    write_varint(&mut body, packet_id);
    body.extend_from_slice(data);

    let mut packet = Vec::with_capacity(body.len() + 5);
    write_varint(&mut packet, body.len() as i32);
    packet.extend_from_slice(&body);
    packet
}

/// Build a login-state Disconnect packet (0x00) with the given reason.
pub fn login_disconnect(reason: &str) -> Vec<u8> {
    let component = json!({ "text": reason });
    let json_str = serde_json::to_string(&component)
        .unwrap_or_else(|_| format!(r#"{{"text":"{reason}"}}"#));

    let mut data = Vec::new();
    write_string(&mut data, &json_str);
    build_packet(0x00, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::decode_varint;

    #[test]
    fn test_login_disconnect_shape() {
        let packet = login_disconnect("You are not allowed on this server.");

        let (frame_len, n) = decode_varint(&packet).unwrap();
        assert_eq!(frame_len as usize, packet.len() - n);

        let payload = &packet[n..];
        let (packet_id, n) = decode_varint(payload).unwrap();
        assert_eq!(packet_id, 0x00);

        let rest = &payload[n..];
        let (str_len, n) = decode_varint(rest).unwrap();
        let json_bytes = &rest[n..n + str_len as usize];
        let parsed: serde_json::Value = serde_json::from_slice(json_bytes).unwrap();
        assert_eq!(parsed["text"], "You are not allowed on this server.");
    }

    #[test]
    fn test_login_disconnect_escapes_reason() {
        let packet = login_disconnect(r#"quote " and \ backslash"#);
        // The packet must still contain valid JSON.
        let (_, n) = decode_varint(&packet).unwrap();
        let payload = &packet[n..];
        let (_, n) = decode_varint(payload).unwrap();
        let rest = &payload[n..];
        let (str_len, n) = decode_varint(rest).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(&rest[n..n + str_len as usize]).unwrap();
        assert_eq!(parsed["text"], r#"quote " and \ backslash"#);
    }
}
