//! WebSocket frame primitives: opcodes, header layout, masking, close codes.
//!
//! Base header (RFC 6455 section 5.2):
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |                               |  Masking-key, if MASK set to 1 |
//! +-------------------------------+-------------------------------+
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, SockwireError};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// FIN bit of the first header byte.
pub const FIN_BIT: u8 = 0x80;

/// RSV1..RSV3 bits of the first header byte.
pub const RSV_BITS: u8 = 0x70;

/// MASK bit of the second header byte.
pub const MASK_BIT: u8 = 0x80;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, ping and pong.
    #[inline]
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Total header length implied by the second header byte.
#[inline]
pub fn header_len(second_byte: u8) -> usize {
    let extended = match second_byte & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask = if second_byte & MASK_BIT != 0 { 4 } else { 0 };
    2 + extended + mask
}

/// XOR `data` with the cycling 4-byte mask key.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Append a frame header to `dst`.
pub fn write_header(dst: &mut BytesMut, fin: bool, op_code: OpCode, len: usize, mask: Option<[u8; 4]>) {
    let first = if fin { FIN_BIT } else { 0 } | op_code.as_u8();
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };

    dst.put_u8(first);
    if len < 126 {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }
    if let Some(mask) = mask {
        dst.put_slice(&mask);
    }
}

/// A decoded WebSocket message (or control frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketMessage {
    pub op_code: OpCode,
    pub data: Bytes,
}

impl WebSocketMessage {
    pub fn new(op_code: OpCode, data: impl Into<Bytes>) -> Self {
        Self {
            op_code,
            data: data.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// Close frame with a status code and UTF-8 reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze())
    }

    /// Payload as text, for text messages.
    pub fn as_text(&self) -> Option<&str> {
        match self.op_code {
            OpCode::Text => std::str::from_utf8(&self.data).ok(),
            _ => None,
        }
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.op_code.is_control()
    }
}

/// Close status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseStatus {
    NormalClosure = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    TooLarge = 1009,
    UnexpectedCondition = 1011,
}

impl CloseStatus {
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::NormalClosure),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::ProtocolError),
            1003 => Some(Self::UnsupportedData),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::TooLarge),
            1011 => Some(Self::UnexpectedCondition),
            _ => None,
        }
    }
}

/// Whether a peer may send `code` in a close frame.
///
/// 0-999 are never valid, 1000-1999 only for the defined statuses,
/// 2000-4999 are open for extensions and applications.
pub fn is_valid_close_code(code: u16) -> bool {
    match code {
        0..=999 => false,
        1000..=1999 => matches!(
            CloseStatus::from_code(code),
            Some(
                CloseStatus::NormalClosure
                    | CloseStatus::GoingAway
                    | CloseStatus::ProtocolError
                    | CloseStatus::UnsupportedData
                    | CloseStatus::TooLarge
                    | CloseStatus::InvalidPayload
            )
        ),
        2000..=4999 => true,
        _ => false,
    }
}

/// Split a close payload into status code and reason.
///
/// An empty payload carries neither. One byte, an invalid code or a
/// non-UTF-8 reason is a protocol error.
pub fn parse_close_payload(payload: &[u8]) -> Result<(Option<u16>, String)> {
    match payload.len() {
        0 => Ok((None, String::new())),
        1 => Err(SockwireError::protocol("close payload of one byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(SockwireError::protocol(format!("invalid close code {code}")));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| SockwireError::protocol("close reason is not valid UTF-8"))?;
            Ok((Some(code), reason.to_string()))
        }
    }
}
