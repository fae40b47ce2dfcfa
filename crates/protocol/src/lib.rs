//! # cmuxd Protocol Library
//!
//! Wire definitions shared by every cmuxd transport.
//!
//! ## Overview
//!
//! All three transports (standard I/O, Unix domain socket, WebSocket) speak
//! the same JSON message grammar:
//!
//! - **Message Definitions**: `ClientMessage` requests and `ServerMessage`
//!   replies/events, one JSON object per logical message
//! - **WebSocket Codec**: the upgrade handshake and single-frame codec used by
//!   the WebSocket listener
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          JSON Messages                  │  {"type": ...}
//! ├──────────────────────┬──────────────────┤
//! │  newline-delimited   │  WebSocket text  │
//! │  (stdio / unix)      │  frames          │
//! └──────────────────────┴──────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ServerMessage, WsFrame};
//!
//! let request = ClientMessage::from_json(r#"{"type":"ping"}"#).unwrap();
//! assert_eq!(request, ClientMessage::Ping);
//!
//! let reply = ServerMessage::Pong.to_json().unwrap();
//! let frame = WsFrame::text(&reply).encode();
//! assert_eq!(frame[0], 0x81);
//! ```

pub mod error;
pub mod messages;
pub mod websocket;

pub use error::{ProtocolError, Result};
pub use messages::{
    capability_list, decode_payload, encode_payload, ClientMessage, NewSession, PaneEntry,
    ServerMessage, SessionEntry, SessionTarget, CAPABILITIES,
};
pub use websocket::{
    accept_key, encode_frame, find_request_end, handshake_response, parse_upgrade_request,
    try_decode_frame, Opcode, WsFrame, MAX_HANDSHAKE_SIZE, MAX_PAYLOAD_SIZE, WS_GUID,
};
