//! HTTP upgrade handshake: request parsing, draft selection and responses.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use md5::Md5;
use sha1::{Digest, Sha1};

use crate::error::{Result, SockwireError};

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Versions advertised when a request matches none.
pub const SUPPORTED_VERSIONS: &str = "13, 8";

/// End of an HTTP header block.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Length of the draft-00 key3 nonce following the header block.
pub const HYBI00_NONCE_LEN: usize = 8;

pub(crate) const HEADER_VERSION: &str = "sec-websocket-version";
pub(crate) const HEADER_KEY: &str = "sec-websocket-key";
pub(crate) const HEADER_KEY1: &str = "sec-websocket-key1";
pub(crate) const HEADER_KEY2: &str = "sec-websocket-key2";
pub(crate) const HEADER_PROTOCOL: &str = "sec-websocket-protocol";

/// WebSocket protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebSocketVersion {
    /// draft-hixie-76 / hybi-00: key pair, MD5 challenge, end-mark framing.
    Hybi00,
    /// hybi-10 (version header "8").
    Hybi10,
    /// RFC 6455 (version header "13").
    Rfc6455,
}

impl WebSocketVersion {
    /// Versions in the order they are tried.
    pub const NEGOTIATION_ORDER: [WebSocketVersion; 3] =
        [Self::Rfc6455, Self::Hybi10, Self::Hybi00];

    /// Numeric version as sent in `Sec-WebSocket-Version`.
    pub fn number(self) -> u8 {
        match self {
            Self::Hybi00 => 0,
            Self::Hybi10 => 8,
            Self::Rfc6455 => 13,
        }
    }

    /// Whether `request` asks for this version.
    pub fn matches(self, request: &HandshakeRequest) -> bool {
        match self {
            Self::Rfc6455 => request.header(HEADER_VERSION) == Some("13"),
            Self::Hybi10 => request.header(HEADER_VERSION) == Some("8"),
            Self::Hybi00 => {
                request.header(HEADER_VERSION).is_none()
                    && request.header(HEADER_KEY1).is_some()
                    && request.header(HEADER_KEY2).is_some()
            }
        }
    }

    /// Uses the binary framing of hybi-10 and later.
    pub fn is_framed(self) -> bool {
        !matches!(self, Self::Hybi00)
    }

    /// Header carrying the client origin.
    pub fn origin_header(self) -> &'static str {
        match self {
            Self::Hybi10 => "sec-websocket-origin",
            Self::Hybi00 | Self::Rfc6455 => "origin",
        }
    }
}

impl fmt::Display for WebSocketVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hybi00 => f.write_str("hybi-00"),
            Self::Hybi10 => f.write_str("hybi-10"),
            Self::Rfc6455 => f.write_str("rfc6455"),
        }
    }
}

/// First version whose rules `request` satisfies.
pub fn select_version(request: &HandshakeRequest) -> Option<WebSocketVersion> {
    WebSocketVersion::NEGOTIATION_ORDER
        .into_iter()
        .find(|version| version.matches(request))
}

/// A parsed upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub method: String,
    pub path: String,
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Parse a header block, without the trailing blank line.
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| SockwireError::protocol("handshake is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
            return Err(SockwireError::protocol(format!(
                "malformed request line {request_line:?}"
            )));
        };

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(SockwireError::protocol(format!("malformed header line {line:?}")));
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        })
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub request: HandshakeRequest,
    pub version: WebSocketVersion,
    pub sub_protocol: Option<String>,
    pub origin: Option<String>,
}

/// `base64(SHA-1(key + GUID))`.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The first client-offered protocol the server supports.
pub fn negotiate_sub_protocol(offered: Option<&str>, supported: &[String]) -> Option<String> {
    offered?
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .find(|name| supported.iter().any(|s| s == name))
        .map(str::to_string)
}

/// Decode a draft-00 security key: its digits divided by its space count.
pub fn hybi00_key_number(key: &str) -> Result<u32> {
    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    let spaces = key.chars().filter(|c| *c == ' ').count() as u64;
    if spaces == 0 {
        return Err(SockwireError::protocol("security key contains no spaces"));
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| SockwireError::protocol("security key has no usable digits"))?;
    Ok((number / spaces) as u32)
}

/// MD5 over both decoded keys (big-endian) and the 8-byte nonce.
pub fn hybi00_challenge_response(key1: &str, key2: &str, nonce: &[u8]) -> Result<[u8; 16]> {
    let mut hasher = Md5::new();
    hasher.update(hybi00_key_number(key1)?.to_be_bytes());
    hasher.update(hybi00_key_number(key2)?.to_be_bytes());
    hasher.update(nonce);

    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

fn push_line(out: &mut String, line: fmt::Arguments<'_>) {
    let _ = out.write_fmt(line);
    out.push_str("\r\n");
}

/// `101 Switching Protocols` for RFC 6455 and hybi-10.
pub fn accept_response(key: &str, sub_protocol: Option<&str>) -> Bytes {
    let mut out = String::with_capacity(160);
    push_line(&mut out, format_args!("HTTP/1.1 101 Switching Protocols"));
    push_line(&mut out, format_args!("Upgrade: WebSocket"));
    push_line(&mut out, format_args!("Connection: Upgrade"));
    push_line(
        &mut out,
        format_args!("Sec-WebSocket-Accept: {}", compute_accept_key(key)),
    );
    if let Some(protocol) = sub_protocol {
        push_line(&mut out, format_args!("Sec-WebSocket-Protocol: {protocol}"));
    }
    out.push_str("\r\n");
    Bytes::from(out)
}

/// Draft-00 response: header block followed by the challenge response.
pub fn hybi00_response(
    request: &HandshakeRequest,
    origin: Option<&str>,
    sub_protocol: Option<&str>,
    challenge: &[u8; 16],
) -> Bytes {
    let mut out = String::with_capacity(192);
    push_line(&mut out, format_args!("HTTP/1.1 101 WebSocket Protocol Handshake"));
    push_line(&mut out, format_args!("Upgrade: WebSocket"));
    push_line(&mut out, format_args!("Connection: Upgrade"));
    if let Some(origin) = origin {
        push_line(&mut out, format_args!("Sec-WebSocket-Origin: {origin}"));
    }
    push_line(
        &mut out,
        format_args!(
            "Sec-WebSocket-Location: ws://{}{}",
            request.host().unwrap_or_default(),
            request.path
        ),
    );
    if let Some(protocol) = sub_protocol {
        push_line(&mut out, format_args!("Sec-WebSocket-Protocol: {protocol}"));
    }
    out.push_str("\r\n");

    let mut buf = BytesMut::with_capacity(out.len() + challenge.len());
    buf.put_slice(out.as_bytes());
    buf.put_slice(challenge);
    buf.freeze()
}

/// `400 Bad Request` listing the supported versions.
pub fn reject_response() -> Bytes {
    let mut out = String::with_capacity(128);
    push_line(&mut out, format_args!("HTTP/1.1 400 Bad Request"));
    push_line(&mut out, format_args!("Upgrade: WebSocket"));
    push_line(&mut out, format_args!("Connection: Upgrade"));
    push_line(&mut out, format_args!("Sec-WebSocket-Version: {SUPPORTED_VERSIONS}"));
    out.push_str("\r\n");
    Bytes::from(out)
}
