//! Minimal Minecraft Java Edition wire protocol support.
//!
//! Only what the proxy needs: length-prefixed frames with VarInt fields,
//! the handshake/LoginStart sniffer, and the clientbound disconnect packet.
//! Payload semantics beyond that are never interpreted; sniffed bytes are
//! replayed to the backend verbatim.

pub mod frame;
pub mod handshake;
pub mod packets;

pub use frame::{FrameError, FrameReader, MAX_FRAME_LEN};
pub use handshake::{Handshake, HandshakeError, NextState, Sniffed, SniffResult};
