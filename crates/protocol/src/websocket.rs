//! Minimal RFC 6455 WebSocket handshake and frame codec.
//!
//! # Frame Format
//!
//! ```text
//! byte 0: FIN | RSV1-3 | opcode (4 bits)
//! byte 1: MASK | payload length (7 bits: 0-125, 126 = u16 follows, 127 = u64 follows)
//! [2 or 8 bytes extended length, big-endian]
//! [4 bytes masking key, when MASK is set]
//! payload
//! ```
//!
//! Only single-frame messages are supported: a frame with FIN clear or a
//! continuation opcode is rejected. Frames written by the server are never
//! masked.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{ProtocolError, Result};

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest frame payload accepted from a client (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Largest HTTP upgrade request accepted before giving up.
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Frame opcodes understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Map a raw opcode nibble to a known opcode.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Err(ProtocolError::Fragmented),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::UnsupportedOpcode(other)),
        }
    }

    /// The raw opcode nibble.
    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// A decoded, unmasked WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl WsFrame {
    /// Create a text frame.
    pub fn text(text: &str) -> Self {
        Self {
            opcode: Opcode::Text,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// Create a pong frame echoing a ping payload.
    pub fn pong(payload: Vec<u8>) -> Self {
        Self {
            opcode: Opcode::Pong,
            payload,
        }
    }

    /// Encode this frame as an unmasked server frame.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.opcode, &self.payload, None)
    }
}

/// Compute `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Extract the `Sec-WebSocket-Key` from a complete HTTP upgrade request.
///
/// Header names are matched case-insensitively.
pub fn parse_upgrade_request(request: &str) -> Result<String> {
    let mut lines = request.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    if !request_line.starts_with("GET ") {
        return Err(ProtocolError::HandshakeFailed(format!(
            "expected GET request, got {:?}",
            request_line
        )));
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
                let key = value.trim();
                if key.is_empty() {
                    break;
                }
                return Ok(key.to_string());
            }
        }
    }

    Err(ProtocolError::HandshakeFailed(
        "missing Sec-WebSocket-Key header".to_string(),
    ))
}

/// Build the `101 Switching Protocols` response for a client key.
pub fn handshake_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}

/// Returns the length of the HTTP request head (through the blank line),
/// or `None` if the terminator has not arrived yet.
pub fn find_request_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Encode a single final frame. A `mask` is only used by clients.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut output = Vec::with_capacity(payload.len() + 14);
    output.push(0x80 | opcode.as_byte());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        output.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        output.push(mask_bit | 126);
        output.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        output.push(mask_bit | 127);
        output.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            output.extend_from_slice(&key);
            output.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => output.extend_from_slice(payload),
    }

    output
}

/// Try to decode one frame from the front of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and the
/// number of bytes consumed.
pub fn try_decode_frame(data: &[u8]) -> Result<Option<(WsFrame, usize)>> {
    if data.len() < 2 {
        return Ok(None);
    }

    let fin = data[0] & 0x80 != 0;
    let opcode = Opcode::from_byte(data[0] & 0x0F)?;
    if !fin {
        return Err(ProtocolError::Fragmented);
    }

    let masked = data[1] & 0x80 != 0;
    let (payload_len, mut offset) = match data[1] & 0x7F {
        126 => {
            if data.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([data[2], data[3]]) as usize, 4)
        }
        127 => {
            if data.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&data[2..10]);
            let len = u64::from_be_bytes(len_bytes);
            if len > MAX_PAYLOAD_SIZE as u64 {
                return Err(ProtocolError::FrameTooLarge {
                    size: usize::try_from(len).unwrap_or(usize::MAX),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            (len as usize, 10)
        }
        len => (len as usize, 2),
    };

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mask = if masked {
        if data.len() < offset + 4 {
            return Ok(None);
        }
        let key = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if data.len() < offset + payload_len {
        return Ok(None);
    }

    let raw = &data[offset..offset + payload_len];
    let payload = match mask {
        Some(key) => raw.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect(),
        None => raw.to_vec(),
    };

    Ok(Some((WsFrame { opcode, payload }, offset + payload_len)))
}
