//! WebSocket session: connection state machine over a channel.
//!
//! ```text
//! AwaitingHandshake ─start─► Handshaking ─101─► Open ─┬─ close_with_handshake ─► ClosingLocal ──┐
//!                                                     └─ peer close frame ─────► ClosingRemote ─┴─► Closed
//! ```
//!
//! The session answers pings and the peer's close frame itself; everything
//! else is handed to the application as a [`WebSocketEvent`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use super::encoder::VersionedEncoder;
use super::filter::{WebSocketFilter, WebSocketPackage};
use super::frame::{self, CloseStatus, OpCode, WebSocketMessage};
use super::handshake::{HandshakeInfo, HandshakeRequest, WebSocketVersion};
use super::monitor::PendingQueues;
use crate::channel::{Channel, CloseReason, PackageStream};
use crate::error::{Result, SockwireError};
use crate::options::WebSocketOptions;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebSocketState {
    AwaitingHandshake,
    Handshaking,
    Open,
    /// We sent a close frame and wait for the peer's.
    ClosingLocal,
    /// The peer sent a close frame and we answered.
    ClosingRemote,
    Closed,
}

impl fmt::Display for WebSocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingHandshake => "awaiting-handshake",
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::ClosingLocal => "closing-local",
            Self::ClosingRemote => "closing-remote",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the application sees from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketEvent {
    /// Handshake completed; the session is open.
    Opened(HandshakeInfo),
    /// The upgrade request named no supported version. The 400 response has
    /// been sent; closing the connection is up to the caller.
    Rejected(HandshakeRequest),
    /// A data message, ping or pong. Pings are already answered.
    Message(WebSocketMessage),
}

#[derive(Debug)]
struct State {
    state: WebSocketState,
    version: Option<WebSocketVersion>,
    sub_protocol: Option<String>,
    close_started: Option<Instant>,
    monitor: Option<Weak<PendingQueues>>,
}

struct Inner {
    channel: Channel<WebSocketFilter>,
    options: Arc<WebSocketOptions>,
    created: Instant,
    state: Mutex<State>,
}

/// Cloneable handle to one WebSocket connection.
#[derive(Clone)]
pub struct WebSocketSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl WebSocketSession {
    /// Wrap an unstarted channel built with [`WebSocketFilter::chain`].
    pub fn new(channel: Channel<WebSocketFilter>, options: Arc<WebSocketOptions>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                options,
                created: Instant::now(),
                state: Mutex::new(State {
                    state: WebSocketState::AwaitingHandshake,
                    version: None,
                    sub_protocol: None,
                    close_started: None,
                    monitor: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the channel and return the event stream.
    pub fn start(&self) -> Result<WebSocketEvents> {
        let packages = self.inner.channel.run()?;
        {
            let mut state = self.lock();
            if state.state == WebSocketState::AwaitingHandshake {
                state.state = WebSocketState::Handshaking;
            }
        }
        Ok(WebSocketEvents {
            session: self.clone(),
            packages,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.channel.id()
    }

    pub fn channel(&self) -> &Channel<WebSocketFilter> {
        &self.inner.channel
    }

    pub fn options(&self) -> &WebSocketOptions {
        &self.inner.options
    }

    pub fn state(&self) -> WebSocketState {
        if self.inner.channel.close_reason().is_some() {
            return WebSocketState::Closed;
        }
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == WebSocketState::Open
    }

    /// True once the channel has begun closing.
    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed()
    }

    pub fn version(&self) -> Option<WebSocketVersion> {
        self.lock().version
    }

    pub fn sub_protocol(&self) -> Option<String> {
        self.lock().sub_protocol.clone()
    }

    /// When the session was created; the opening handshake deadline runs from here.
    pub fn handshake_started(&self) -> Instant {
        self.inner.created
    }

    /// When we sent our close frame, if we did.
    pub fn close_started(&self) -> Option<Instant> {
        self.lock().close_started
    }

    pub(crate) fn attach_monitor(&self, queues: Weak<PendingQueues>) {
        self.lock().monitor = Some(queues);
    }

    /// Whether the opening handshake is still outstanding.
    pub(crate) fn is_handshake_pending(&self) -> bool {
        matches!(
            self.lock().state,
            WebSocketState::AwaitingHandshake | WebSocketState::Handshaking
        )
    }

    /// Send a text message.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(&WebSocketMessage::text(text)).await
    }

    /// Send a binary message.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(&WebSocketMessage::binary(data)).await
    }

    pub async fn send_ping(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(&WebSocketMessage::ping(data)).await
    }

    /// Send a message on an open session.
    pub async fn send(&self, message: &WebSocketMessage) -> Result<()> {
        match self.state() {
            WebSocketState::Open => self.send_frame(message).await,
            WebSocketState::AwaitingHandshake | WebSocketState::Handshaking => {
                Err(SockwireError::protocol("WebSocket handshake not complete"))
            }
            _ => Err(SockwireError::ChannelClosed),
        }
    }

    async fn send_frame(&self, message: &WebSocketMessage) -> Result<()> {
        let version = self
            .version()
            .ok_or_else(|| SockwireError::protocol("WebSocket handshake not complete"))?;
        let mut encoder = VersionedEncoder::for_version(version, self.inner.options.max_frame_payload);
        self.inner.channel.send_package(&mut encoder, message).await
    }

    /// Send a close frame and wait for the peer's.
    ///
    /// The channel closes with [`CloseReason::LocalClosing`] once the peer
    /// answers, or with [`CloseReason::TimeOut`] if a monitor sweeps it
    /// first. A session that is not open is closed immediately.
    pub async fn close_with_handshake(&self, status: u16, reason: &str) -> Result<()> {
        let monitor = {
            let mut state = self.lock();
            if state.state != WebSocketState::Open || self.inner.channel.is_closed() {
                drop(state);
                self.inner.channel.abort(CloseReason::LocalClosing);
                return Ok(());
            }
            state.state = WebSocketState::ClosingLocal;
            state.close_started = Some(Instant::now());
            state.monitor.as_ref().and_then(Weak::upgrade)
        };

        if let Some(queues) = monitor {
            queues.push_close(self.clone());
        }

        debug!(session_id = self.id(), status, "sending close frame");
        let result = self.send_frame(&WebSocketMessage::close(status, reason)).await;
        if result.is_err() {
            self.inner.channel.abort(CloseReason::LocalClosing);
        }
        result
    }

    /// Close without a closing handshake and wait until the channel is down.
    pub async fn close(&self, reason: CloseReason) -> CloseReason {
        self.inner.channel.close(reason).await
    }

    /// Begin closing without waiting. Returns false if already closing.
    pub fn force_close(&self, reason: CloseReason) -> bool {
        self.inner.channel.abort(reason)
    }

    /// Wait until the channel has closed.
    pub async fn closed(&self) -> CloseReason {
        self.inner.channel.closed().await
    }

    fn opened(&self, info: &HandshakeInfo) {
        let mut state = self.lock();
        state.state = WebSocketState::Open;
        state.version = Some(info.version);
        state.sub_protocol = info.sub_protocol.clone();
        info!(
            session_id = self.id(),
            version = %info.version,
            path = %info.request.path,
            "WebSocket session opened"
        );
    }

    async fn on_ping(&self, payload: &Bytes) {
        if let Err(e) = self.send_frame(&WebSocketMessage::pong(payload.clone())).await {
            debug!(session_id = self.id(), error = %e, "pong not sent");
        }
    }

    async fn on_close(&self, payload: &Bytes) {
        let previous = {
            let mut state = self.lock();
            let previous = state.state;
            if previous == WebSocketState::Open {
                state.state = WebSocketState::ClosingRemote;
            }
            previous
        };

        match previous {
            WebSocketState::ClosingLocal => {
                debug!(session_id = self.id(), "close handshake completed");
                self.inner.channel.abort(CloseReason::LocalClosing);
            }
            WebSocketState::Open => {
                let reply = self.close_reply(payload);
                if let Err(e) = self.send_frame(&reply).await {
                    debug!(session_id = self.id(), error = %e, "close reply not sent");
                }
                self.inner.channel.abort(CloseReason::RemoteClosing);
            }
            _ => {}
        }
    }

    /// The close frame answering a peer's close payload.
    fn close_reply(&self, payload: &[u8]) -> WebSocketMessage {
        if self.version() == Some(WebSocketVersion::Hybi00) {
            return WebSocketMessage::new(OpCode::Close, Bytes::new());
        }
        match frame::parse_close_payload(payload) {
            Ok((Some(code), _)) => WebSocketMessage::close(code, ""),
            Ok((None, _)) => WebSocketMessage::close(CloseStatus::NormalClosure.code(), ""),
            Err(e) => {
                debug!(session_id = self.id(), error = %e, "invalid close frame");
                WebSocketMessage::close(CloseStatus::ProtocolError.code(), "")
            }
        }
    }
}

/// Event stream of one session, returned by [`WebSocketSession::start`].
pub struct WebSocketEvents {
    session: WebSocketSession,
    packages: PackageStream<WebSocketPackage>,
}

impl WebSocketEvents {
    pub fn session(&self) -> &WebSocketSession {
        &self.session
    }

    /// Next event, or `None` once the session has closed.
    pub async fn next(&mut self) -> Option<WebSocketEvent> {
        loop {
            let package = self.packages.next().await?;
            match package {
                WebSocketPackage::Handshake(info) => {
                    self.session.opened(&info);
                    return Some(WebSocketEvent::Opened(info));
                }
                WebSocketPackage::Rejected(request) => {
                    debug!(session_id = self.session.id(), "WebSocket upgrade rejected");
                    return Some(WebSocketEvent::Rejected(request));
                }
                WebSocketPackage::Message(message) => match message.op_code {
                    OpCode::Close => self.session.on_close(&message.data).await,
                    OpCode::Ping => {
                        self.session.on_ping(&message.data).await;
                        return Some(WebSocketEvent::Message(message));
                    }
                    _ => return Some(WebSocketEvent::Message(message)),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ConnectionOptions;
    use crate::websocket::frame::{apply_mask, write_header};
    use bytes::BytesMut;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    const UPGRADE: &[u8] = b"GET /echo HTTP/1.1\r\nHost: localhost\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";

    fn session() -> (WebSocketSession, DuplexStream) {
        let options = Arc::new(WebSocketOptions::default());
        let (local, remote) = duplex(64 * 1024);
        let channel = Channel::from_stream(
            local,
            WebSocketFilter::chain(options.clone()),
            ConnectionOptions::default(),
        )
        .unwrap();
        (WebSocketSession::new(channel, options), remote)
    }

    fn client_frame(op_code: OpCode, payload: &[u8]) -> Vec<u8> {
        let mask = [1, 2, 3, 4];
        let mut out = BytesMut::new();
        write_header(&mut out, true, op_code, payload.len(), Some(mask));
        let mut body = payload.to_vec();
        apply_mask(&mut body, mask);
        out.extend_from_slice(&body);
        out.to_vec()
    }

    async fn read_response(remote: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(remote.read_u8().await.unwrap());
        }
        String::from_utf8(head).unwrap()
    }

    async fn read_frame(remote: &mut DuplexStream) -> (u8, Vec<u8>) {
        let first = remote.read_u8().await.unwrap();
        let len = remote.read_u8().await.unwrap() as usize;
        let mut payload = vec![0u8; len];
        remote.read_exact(&mut payload).await.unwrap();
        (first, payload)
    }

    async fn open(remote: &mut DuplexStream, events: &mut WebSocketEvents) {
        remote.write_all(UPGRADE).await.unwrap();
        assert!(matches!(events.next().await, Some(WebSocketEvent::Opened(_))));
        let response = read_response(remote).await;
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    }

    #[tokio::test]
    async fn test_open_and_echo() {
        let (session, mut remote) = session();
        assert_eq!(session.state(), WebSocketState::AwaitingHandshake);
        let mut events = session.start().unwrap();
        assert_eq!(session.state(), WebSocketState::Handshaking);
        assert!(session.send_text("early").await.is_err());

        open(&mut remote, &mut events).await;
        assert!(session.is_open());
        assert_eq!(session.version(), Some(WebSocketVersion::Rfc6455));

        remote.write_all(&client_frame(OpCode::Text, b"hello")).await.unwrap();
        let Some(WebSocketEvent::Message(message)) = events.next().await else {
            panic!("expected message");
        };
        assert_eq!(message.as_text(), Some("hello"));

        session.send_text("hello").await.unwrap();
        assert_eq!(read_frame(&mut remote).await, (0x81, b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (session, mut remote) = session();
        let mut events = session.start().unwrap();
        open(&mut remote, &mut events).await;

        remote.write_all(&client_frame(OpCode::Ping, b"beat")).await.unwrap();
        let Some(WebSocketEvent::Message(ping)) = events.next().await else {
            panic!("expected ping");
        };
        assert_eq!(ping.op_code, OpCode::Ping);
        assert_eq!(read_frame(&mut remote).await, (0x8A, b"beat".to_vec()));
    }

    #[tokio::test]
    async fn test_remote_close_is_echoed() {
        let (session, mut remote) = session();
        let mut events = session.start().unwrap();
        open(&mut remote, &mut events).await;

        let close = WebSocketMessage::close(1001, "bye");
        remote.write_all(&client_frame(OpCode::Close, &close.data)).await.unwrap();

        assert!(events.next().await.is_none());
        assert_eq!(read_frame(&mut remote).await, (0x88, vec![0x03, 0xE9]));
        assert_eq!(session.closed().await, CloseReason::RemoteClosing);
        assert_eq!(session.state(), WebSocketState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_close_code_answered_with_protocol_error() {
        let (session, mut remote) = session();
        let mut events = session.start().unwrap();
        open(&mut remote, &mut events).await;

        remote.write_all(&client_frame(OpCode::Close, &[0x03, 0xE7])).await.unwrap();
        assert!(events.next().await.is_none());
        assert_eq!(read_frame(&mut remote).await, (0x88, vec![0x03, 0xEA]));
    }

    #[tokio::test]
    async fn test_local_close_handshake() {
        let (session, mut remote) = session();
        let mut events = session.start().unwrap();
        open(&mut remote, &mut events).await;

        session
            .close_with_handshake(CloseStatus::NormalClosure.code(), "done")
            .await
            .unwrap();
        assert_eq!(session.state(), WebSocketState::ClosingLocal);
        assert!(session.close_started().is_some());
        assert!(session.send_text("late").await.is_err());

        let (first, payload) = read_frame(&mut remote).await;
        assert_eq!(first, 0x88);
        assert_eq!(&payload[2..], b"done");

        remote.write_all(&client_frame(OpCode::Close, &payload[..2])).await.unwrap();
        assert!(events.next().await.is_none());
        assert_eq!(session.closed().await, CloseReason::LocalClosing);
    }

    #[tokio::test]
    async fn test_rejected_upgrade_stays_unopened() {
        let (session, mut remote) = session();
        let mut events = session.start().unwrap();

        remote.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        assert!(matches!(events.next().await, Some(WebSocketEvent::Rejected(_))));
        let response = read_response(&mut remote).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(session.state(), WebSocketState::Handshaking);
        assert!(!session.is_closed());

        assert_eq!(session.close(CloseReason::LocalClosing).await, CloseReason::LocalClosing);
    }
}
