//! WebSocket pipeline filter.
//!
//! One filter type walks through the protocol phases. Each phase change is a
//! filter switch, so bytes that arrived with the handshake are decoded by the
//! next phase without another read:
//!
//! ```text
//! Handshake ──"13"/"8"──────────────► Frames
//!     │ key pair ─► Hybi00Nonce ────► Hybi00Frames
//!     └ no match ─────────────────────► Rejected (drains input)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::frame::{self, OpCode, WebSocketMessage, FIN_BIT, MASK_BIT, MAX_CONTROL_PAYLOAD, RSV_BITS};
use super::handshake::{
    self, HandshakeInfo, HandshakeRequest, WebSocketVersion, HEADER_KEY, HEADER_KEY1, HEADER_KEY2,
    HEADER_PROTOCOL, HEADER_TERMINATOR, HYBI00_NONCE_LEN,
};
use crate::error::{Result, SockwireError};
use crate::options::WebSocketOptions;
use crate::protocol::{
    FilterChain, FilterContext, FixedSizeFilter, PipelineFilter, SequenceReader, TerminatorFilter,
};

/// Packages produced by [`WebSocketFilter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketPackage {
    /// The handshake succeeded and the response is already queued.
    Handshake(HandshakeInfo),
    /// No supported version matched; a 400 response is queued.
    Rejected(HandshakeRequest),
    /// A complete message or control frame.
    Message(WebSocketMessage),
}

/// Per-connection negotiated state shared by every phase of the filter.
#[derive(Debug)]
pub struct WebSocketContext {
    options: Arc<WebSocketOptions>,
    version: Option<WebSocketVersion>,
    sub_protocol: Option<String>,
    replies: VecDeque<Bytes>,

    // Header of the frame being read.
    op_code: OpCode,
    fin: bool,
    payload_length: usize,
    mask: Option<[u8; 4]>,

    // Fragmented message in progress.
    message_op: Option<OpCode>,
    fragments: Vec<Bytes>,
    fragments_len: usize,
    max_message_length: usize,
}

impl WebSocketContext {
    pub fn new(options: Arc<WebSocketOptions>) -> Self {
        Self {
            options,
            version: None,
            sub_protocol: None,
            replies: VecDeque::new(),
            op_code: OpCode::Continuation,
            fin: true,
            payload_length: 0,
            mask: None,
            message_op: None,
            fragments: Vec::new(),
            fragments_len: 0,
            max_message_length: 0,
        }
    }

    pub fn options(&self) -> &WebSocketOptions {
        &self.options
    }

    /// Negotiated version, once the handshake completed.
    pub fn version(&self) -> Option<WebSocketVersion> {
        self.version
    }

    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.as_deref()
    }

    /// Current frame opcode.
    pub fn op_code(&self) -> OpCode {
        self.op_code
    }

    /// Expected payload length of the current frame.
    pub fn payload_length(&self) -> usize {
        self.payload_length
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// True while a fragmented message awaits its final frame.
    pub fn in_message(&self) -> bool {
        self.message_op.is_some()
    }

    /// Largest message the fragments of one message may add up to (0 = unlimited).
    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    fn negotiated(&mut self, version: WebSocketVersion, sub_protocol: Option<String>) {
        self.version = Some(version);
        self.sub_protocol = sub_protocol;
    }

    /// Validate a frame header and make it current.
    fn begin_frame(&mut self, first: u8, second: u8, length: u64, mask: Option<[u8; 4]>) -> Result<()> {
        if first & RSV_BITS != 0 {
            return Err(SockwireError::protocol("reserved bits set without a negotiated extension"));
        }
        let op_code = OpCode::from_u8(first & 0x0F)
            .ok_or_else(|| SockwireError::protocol(format!("unknown opcode {:#x}", first & 0x0F)))?;
        let fin = first & FIN_BIT != 0;

        if self.options.require_mask && second & MASK_BIT == 0 {
            return Err(SockwireError::protocol("client frame is not masked"));
        }
        if length > i64::MAX as u64 {
            return Err(SockwireError::protocol("payload length has the high bit set"));
        }
        let length = usize::try_from(length)
            .map_err(|_| SockwireError::protocol("payload length does not fit in memory"))?;

        if op_code.is_control() {
            if !fin {
                return Err(SockwireError::protocol("fragmented control frame"));
            }
            if length > MAX_CONTROL_PAYLOAD {
                return Err(SockwireError::protocol(format!(
                    "control frame payload of {length} bytes"
                )));
            }
        } else if op_code == OpCode::Continuation {
            if self.message_op.is_none() {
                return Err(SockwireError::protocol("continuation frame without a message"));
            }
        } else if self.message_op.is_some() {
            return Err(SockwireError::protocol(
                "new data frame while a fragmented message is in progress",
            ));
        }

        if !op_code.is_control() && self.max_message_length > 0 {
            let total = self.fragments_len.saturating_add(length);
            if total > self.max_message_length {
                return Err(SockwireError::protocol(format!(
                    "message of {total} bytes exceeds maximum {}",
                    self.max_message_length
                )));
            }
        }

        self.op_code = op_code;
        self.fin = fin;
        self.payload_length = length;
        self.mask = mask;
        Ok(())
    }

    /// Turn the current frame's payload into a package, or stash a fragment.
    fn resolve(&mut self, payload: Bytes) -> Result<Option<WebSocketPackage>> {
        let op_code = self.op_code;
        if op_code.is_control() {
            return Ok(Some(WebSocketPackage::Message(WebSocketMessage::new(op_code, payload))));
        }

        if !self.fin {
            if op_code != OpCode::Continuation {
                self.message_op = Some(op_code);
            }
            self.fragments_len += payload.len();
            self.fragments.push(payload);
            return Ok(None);
        }

        let (op_code, data) = match self.message_op.take() {
            None => (op_code, payload),
            Some(message_op) => {
                self.fragments.push(payload);
                let total = self.fragments_len + self.fragments.last().map_or(0, Bytes::len);
                self.fragments_len = 0;
                let mut data = BytesMut::with_capacity(total);
                for fragment in self.fragments.drain(..) {
                    data.extend_from_slice(&fragment);
                }
                (message_op, data.freeze())
            }
        };

        if op_code == OpCode::Text && std::str::from_utf8(&data).is_err() {
            return Err(SockwireError::protocol("text message is not valid UTF-8"));
        }
        Ok(Some(WebSocketPackage::Message(WebSocketMessage::new(op_code, data))))
    }
}

impl FilterContext for WebSocketContext {
    fn take_reply(&mut self) -> Option<Bytes> {
        self.replies.pop_front()
    }

    fn set_max_package_length(&mut self, max: usize) {
        self.max_message_length = max;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePart {
    Header,
    Payload,
}

#[derive(Debug, Clone)]
enum Hybi00Part {
    Start,
    Text(TerminatorFilter),
    Close(TerminatorFilter),
}

#[derive(Debug, Clone)]
enum Stage {
    Handshake(TerminatorFilter),
    Hybi00Nonce(Option<HandshakeInfo>),
    Frames(FramePart),
    Hybi00Frames(Hybi00Part),
    Rejected,
}

/// Decodes the upgrade handshake and then WebSocket frames.
#[derive(Debug, Clone)]
pub struct WebSocketFilter {
    stage: Stage,
    next: Option<Stage>,
}

impl Default for WebSocketFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketFilter {
    /// A filter waiting for the upgrade request.
    pub fn new() -> Self {
        Self::at(Stage::Handshake(TerminatorFilter::new(Bytes::from_static(
            HEADER_TERMINATOR,
        ))))
    }

    fn at(stage: Stage) -> Self {
        Self { stage, next: None }
    }

    /// A fresh chain for one connection.
    pub fn chain(options: Arc<WebSocketOptions>) -> FilterChain<Self> {
        FilterChain::new(Self::new(), WebSocketContext::new(options))
    }

    /// Name of the current phase.
    pub fn phase(&self) -> &'static str {
        match self.stage {
            Stage::Handshake(_) => "handshake",
            Stage::Hybi00Nonce(_) => "hybi00-nonce",
            Stage::Frames(_) => "frames",
            Stage::Hybi00Frames(_) => "hybi00-frames",
            Stage::Rejected => "rejected",
        }
    }

    fn handshake(
        next: &mut Option<Stage>,
        head: Bytes,
        ctx: &mut WebSocketContext,
    ) -> Result<Option<WebSocketPackage>> {
        let request = HandshakeRequest::parse(&head)?;

        let Some(version) = handshake::select_version(&request) else {
            debug!(path = %request.path, "no supported WebSocket version requested");
            ctx.replies.push_back(handshake::reject_response());
            *next = Some(Stage::Rejected);
            return Ok(Some(WebSocketPackage::Rejected(request)));
        };

        let sub_protocol = handshake::negotiate_sub_protocol(
            request.header(HEADER_PROTOCOL),
            &ctx.options.sub_protocols,
        );
        let origin = request.header(version.origin_header()).map(str::to_string);

        if version == WebSocketVersion::Hybi00 {
            *next = Some(Stage::Hybi00Nonce(Some(HandshakeInfo {
                request,
                version,
                sub_protocol,
                origin,
            })));
            return Ok(None);
        }

        let key = request
            .header(HEADER_KEY)
            .ok_or_else(|| SockwireError::protocol("missing Sec-WebSocket-Key"))?;
        ctx.replies
            .push_back(handshake::accept_response(key, sub_protocol.as_deref()));
        ctx.negotiated(version, sub_protocol.clone());
        *next = Some(Stage::Frames(FramePart::Header));

        debug!(%version, path = %request.path, "WebSocket handshake accepted");
        Ok(Some(WebSocketPackage::Handshake(HandshakeInfo {
            request,
            version,
            sub_protocol,
            origin,
        })))
    }

    fn hybi00_nonce(
        next: &mut Option<Stage>,
        pending: &mut Option<HandshakeInfo>,
        reader: &mut SequenceReader<'_>,
        ctx: &mut WebSocketContext,
    ) -> Result<Option<WebSocketPackage>> {
        let Some(nonce) = FixedSizeFilter::new(HYBI00_NONCE_LEN).decode(reader) else {
            return Ok(None);
        };
        let info = pending
            .take()
            .ok_or_else(|| SockwireError::protocol("draft-00 nonce without a request"))?;

        let key1 = info.request.header(HEADER_KEY1).unwrap_or_default();
        let key2 = info.request.header(HEADER_KEY2).unwrap_or_default();
        let challenge = handshake::hybi00_challenge_response(key1, key2, &nonce)?;

        ctx.replies.push_back(handshake::hybi00_response(
            &info.request,
            info.origin.as_deref(),
            info.sub_protocol.as_deref(),
            &challenge,
        ));
        ctx.negotiated(info.version, info.sub_protocol.clone());
        *next = Some(Stage::Hybi00Frames(Hybi00Part::Start));

        debug!(path = %info.request.path, "draft-00 handshake accepted");
        Ok(Some(WebSocketPackage::Handshake(info)))
    }

    fn frames(
        part: &mut FramePart,
        reader: &mut SequenceReader<'_>,
        ctx: &mut WebSocketContext,
    ) -> Result<Option<WebSocketPackage>> {
        match part {
            FramePart::Header => {
                let mut head = [0u8; 2];
                if !reader.peek_into(&mut head) {
                    return Ok(None);
                }
                if reader.remaining() < frame::header_len(head[1]) {
                    return Ok(None);
                }
                reader.advance(2);

                let length = match head[1] & 0x7F {
                    126 => reader.try_read_u16_be().map(u64::from),
                    127 => reader.try_read_u64_be(),
                    n => Some(u64::from(n)),
                }
                .ok_or_else(|| SockwireError::protocol("truncated frame header"))?;

                let mask = if head[1] & MASK_BIT != 0 {
                    let mut key = [0u8; 4];
                    if !reader.peek_into(&mut key) {
                        return Err(SockwireError::protocol("truncated masking key"));
                    }
                    reader.advance(4);
                    Some(key)
                } else {
                    None
                };

                ctx.begin_frame(head[0], head[1], length, mask)?;

                // Empty payloads resolve here; the payload phase would
                // consume nothing and stall on bytes already buffered.
                if ctx.payload_length == 0 {
                    return ctx.resolve(Bytes::new());
                }
                *part = FramePart::Payload;
                Ok(None)
            }
            FramePart::Payload => {
                let Some(payload) = reader.read_bytes(ctx.payload_length) else {
                    return Ok(None);
                };
                *part = FramePart::Header;

                let payload = match ctx.mask {
                    Some(mask) => {
                        let mut unmasked = BytesMut::from(&payload[..]);
                        frame::apply_mask(&mut unmasked, mask);
                        unmasked.freeze()
                    }
                    None => payload,
                };
                ctx.resolve(payload)
            }
        }
    }

    fn hybi00_frames(
        part: &mut Hybi00Part,
        reader: &mut SequenceReader<'_>,
    ) -> Result<Option<WebSocketPackage>> {
        match part {
            Hybi00Part::Start => {
                let Some(first) = reader.peek() else {
                    return Ok(None);
                };
                if first == 0xFF {
                    reader.advance(1);
                    *part = Hybi00Part::Close(TerminatorFilter::new(Bytes::from_static(b"\x00")));
                } else if first & 0x80 == 0 {
                    reader.advance(1);
                    *part = Hybi00Part::Text(TerminatorFilter::new(Bytes::from_static(b"\xff")));
                } else {
                    warn!(frame_type = first, "draft-00 length-prefixed frame received");
                    return Err(SockwireError::NotImplemented(
                        "draft-00 length-prefixed frames",
                    ));
                }
                Ok(None)
            }
            Hybi00Part::Text(terminator) => {
                let Some(data) = terminator.decode(reader) else {
                    return Ok(None);
                };
                if std::str::from_utf8(&data).is_err() {
                    return Err(SockwireError::protocol("text message is not valid UTF-8"));
                }
                *part = Hybi00Part::Start;
                Ok(Some(WebSocketPackage::Message(WebSocketMessage::new(
                    OpCode::Text,
                    data,
                ))))
            }
            Hybi00Part::Close(terminator) => {
                if terminator.decode(reader).is_none() {
                    return Ok(None);
                }
                *part = Hybi00Part::Start;
                Ok(Some(WebSocketPackage::Message(WebSocketMessage::new(
                    OpCode::Close,
                    Bytes::new(),
                ))))
            }
        }
    }
}

impl PipelineFilter for WebSocketFilter {
    type Package = WebSocketPackage;
    type Context = WebSocketContext;

    fn filter(
        &mut self,
        reader: &mut SequenceReader<'_>,
        ctx: &mut WebSocketContext,
    ) -> Result<Option<WebSocketPackage>> {
        match &mut self.stage {
            Stage::Handshake(terminator) => match terminator.decode(reader) {
                Some(head) => Self::handshake(&mut self.next, head, ctx),
                None => Ok(None),
            },
            Stage::Hybi00Nonce(pending) => Self::hybi00_nonce(&mut self.next, pending, reader, ctx),
            Stage::Frames(part) => Self::frames(part, reader, ctx),
            Stage::Hybi00Frames(part) => Self::hybi00_frames(part, reader),
            Stage::Rejected => {
                let remaining = reader.remaining();
                reader.advance(remaining);
                Ok(None)
            }
        }
    }

    fn next_filter(&mut self) -> Option<Self> {
        self.next.take().map(Self::at)
    }

    fn is_discarding(&self) -> bool {
        matches!(self.stage, Stage::Rejected)
    }

    fn reset(&mut self) {
        match &mut self.stage {
            Stage::Handshake(terminator) => terminator.reset(),
            Stage::Frames(part) => *part = FramePart::Header,
            Stage::Hybi00Frames(part) => *part = Hybi00Part::Start,
            Stage::Hybi00Nonce(_) | Stage::Rejected => {}
        }
    }
}
