//! Integration tests for WebSocket sessions over TCP and in-memory streams.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use sockwire::channel::{Channel, CloseReason};
use sockwire::options::{ConnectionOptions, ListenOptions, WebSocketOptions};
use sockwire::protocol::PackageEncoder;
use sockwire::transport::{ChannelCreator, TcpConnectionListener};
use sockwire::websocket::frame::{apply_mask, write_header};
use sockwire::websocket::{
    HandshakeMonitor, OpCode, WebSocketEvent, WebSocketEvents, WebSocketFilter,
    WebSocketMaskedEncoder, WebSocketMessage, WebSocketSession, WebSocketState, WebSocketVersion,
};
use sockwire::SessionContainer;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const UPGRADE_13: &[u8] = b"GET /chat HTTP/1.1\r\n\
Host: localhost\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

/// A masked client frame with an explicit FIN flag.
fn client_frame(fin: bool, op_code: OpCode, payload: &[u8]) -> Vec<u8> {
    let mask = [0xA1, 0xB2, 0xC3, 0xD4];
    let mut out = BytesMut::new();
    write_header(&mut out, fin, op_code, payload.len(), Some(mask));
    let mut body = payload.to_vec();
    apply_mask(&mut body, mask);
    out.extend_from_slice(&body);
    out.to_vec()
}

async fn read_http_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(reader.read_u8().await.unwrap());
    }
    String::from_utf8(head).unwrap()
}

/// Read one short unmasked server frame.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> (u8, Vec<u8>) {
    let first = reader.read_u8().await.unwrap();
    let len = reader.read_u8().await.unwrap() as usize;
    assert!(len < 126);
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.unwrap();
    (first, payload)
}

struct Server {
    listener: TcpConnectionListener,
    addr: std::net::SocketAddr,
    sessions: mpsc::UnboundedReceiver<(WebSocketSession, WebSocketEvents)>,
}

async fn server(connection: ConnectionOptions, websocket: WebSocketOptions) -> Server {
    let websocket = Arc::new(websocket);
    let chain_options = websocket.clone();
    let creator = ChannelCreator::new(connection, move || WebSocketFilter::chain(chain_options.clone()))
        .unwrap();

    let mut listener = TcpConnectionListener::new(ListenOptions::default());
    let (tx, sessions) = mpsc::unbounded_channel();
    let addr = listener
        .start(move |_, connection| {
            let session = WebSocketSession::new(creator.create(connection), websocket.clone());
            let events = session.start().unwrap();
            let _ = tx.send((session, events));
        })
        .await
        .unwrap();

    Server {
        listener,
        addr,
        sessions,
    }
}

/// Version "13" upgrade, then a masked single-frame text message.
#[tokio::test]
async fn test_rfc6455_handshake_and_text_over_tcp() {
    let mut server = server(ConnectionOptions::default(), WebSocketOptions::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let (session, mut events) = server.sessions.recv().await.unwrap();

    client.write_all(UPGRADE_13).await.unwrap();
    let Some(WebSocketEvent::Opened(info)) = events.next().await else {
        panic!("expected the session to open");
    };
    assert_eq!(info.version, WebSocketVersion::Rfc6455);
    assert_eq!(session.state(), WebSocketState::Open);

    let head = read_http_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    client
        .write_all(&client_frame(true, OpCode::Text, b"hello"))
        .await
        .unwrap();
    let Some(WebSocketEvent::Message(message)) = events.next().await else {
        panic!("expected a message");
    };
    assert_eq!(message.op_code, OpCode::Text);
    assert_eq!(message.as_text(), Some("hello"));

    session.send_text(message.as_text().unwrap()).await.unwrap();
    assert_eq!(read_frame(&mut client).await, (0x81, b"hello".to_vec()));

    server.listener.stop().await;
}

/// "he" + continuation "llo" yields one message, after the second frame,
/// and an empty ping in between does not disturb it.
#[tokio::test]
async fn test_fragmented_message_with_empty_ping() {
    let mut server = server(ConnectionOptions::default(), WebSocketOptions::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let (_session, mut events) = server.sessions.recv().await.unwrap();

    client.write_all(UPGRADE_13).await.unwrap();
    assert!(matches!(events.next().await, Some(WebSocketEvent::Opened(_))));
    read_http_head(&mut client).await;

    client
        .write_all(&client_frame(false, OpCode::Text, b"he"))
        .await
        .unwrap();
    client
        .write_all(&client_frame(true, OpCode::Ping, b""))
        .await
        .unwrap();

    let Some(WebSocketEvent::Message(ping)) = events.next().await else {
        panic!("expected the ping");
    };
    assert_eq!(ping.op_code, OpCode::Ping);
    assert!(ping.data.is_empty());
    assert_eq!(read_frame(&mut client).await, (0x8A, Vec::new()));

    client
        .write_all(&client_frame(true, OpCode::Continuation, b"llo"))
        .await
        .unwrap();
    let Some(WebSocketEvent::Message(message)) = events.next().await else {
        panic!("expected the message");
    };
    assert_eq!(message.as_text(), Some("hello"));

    server.listener.stop().await;
}

/// No version header and no draft-00 keys: 400 listing "13, 8", never opened.
#[tokio::test]
async fn test_unsupported_version_is_rejected() {
    let mut server = server(ConnectionOptions::default(), WebSocketOptions::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let (session, mut events) = server.sessions.recv().await.unwrap();

    client
        .write_all(b"GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();
    assert!(matches!(events.next().await, Some(WebSocketEvent::Rejected(_))));

    let head = read_http_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(head.contains("Sec-WebSocket-Version: 13, 8\r\n"));
    assert_ne!(session.state(), WebSocketState::Open);
    assert!(session.send_text("nope").await.is_err());

    // Later bytes are discarded, not decoded.
    client
        .write_all(&client_frame(true, OpCode::Text, b"ignored"))
        .await
        .unwrap();
    session.close(CloseReason::LocalClosing).await;
    assert!(events.next().await.is_none());

    server.listener.stop().await;
}

/// A frame exactly at the package limit decodes; one byte more closes the channel.
#[tokio::test]
async fn test_frame_at_max_package_length() {
    const MAX: usize = 1024;
    let connection = ConnectionOptions::default().with_max_package_length(MAX);
    let mut server = server(connection, WebSocketOptions::default()).await;

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let (_session, mut events) = server.sessions.recv().await.unwrap();
    client.write_all(UPGRADE_13).await.unwrap();
    assert!(matches!(events.next().await, Some(WebSocketEvent::Opened(_))));
    read_http_head(&mut client).await;

    let exact = vec![b'a'; MAX];
    client
        .write_all(&client_frame(true, OpCode::Binary, &exact))
        .await
        .unwrap();
    let Some(WebSocketEvent::Message(message)) = events.next().await else {
        panic!("expected the exact-size frame");
    };
    assert_eq!(message.data.len(), MAX);

    let mut other = TcpStream::connect(server.addr).await.unwrap();
    let (session, mut events) = server.sessions.recv().await.unwrap();
    other.write_all(UPGRADE_13).await.unwrap();
    assert!(matches!(events.next().await, Some(WebSocketEvent::Opened(_))));

    let over = vec![b'a'; MAX + 1];
    other
        .write_all(&client_frame(true, OpCode::Binary, &over))
        .await
        .unwrap();
    assert!(events.next().await.is_none());
    assert_eq!(session.closed().await, CloseReason::ProtocolError);

    server.listener.stop().await;
}

/// Fragments that each fit the package limit still may not add up past it.
#[tokio::test]
async fn test_fragmented_message_past_max_package_length() {
    const MAX: usize = 1024;
    let connection = ConnectionOptions::default().with_max_package_length(MAX);
    let mut server = server(connection, WebSocketOptions::default()).await;

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let (session, mut events) = server.sessions.recv().await.unwrap();
    client.write_all(UPGRADE_13).await.unwrap();
    assert!(matches!(events.next().await, Some(WebSocketEvent::Opened(_))));
    read_http_head(&mut client).await;

    let mut frames = client_frame(false, OpCode::Text, &[b'x'; 600]);
    for _ in 0..20 {
        frames.extend(client_frame(false, OpCode::Continuation, &[b'y'; 600]));
    }
    frames.extend(client_frame(true, OpCode::Continuation, b"done"));
    // The server may hang up before the write completes.
    let _ = client.write_all(&frames).await;

    assert!(events.next().await.is_none());
    assert_eq!(session.closed().await, CloseReason::ProtocolError);

    server.listener.stop().await;
}

/// A peer close frame is answered and the channel closes as remote-closing.
#[tokio::test]
async fn test_remote_close_handshake_over_tcp() {
    let mut server = server(ConnectionOptions::default(), WebSocketOptions::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let (session, mut events) = server.sessions.recv().await.unwrap();

    client.write_all(UPGRADE_13).await.unwrap();
    assert!(matches!(events.next().await, Some(WebSocketEvent::Opened(_))));
    read_http_head(&mut client).await;

    let close = WebSocketMessage::close(1000, "done");
    client
        .write_all(&client_frame(true, OpCode::Close, &close.data))
        .await
        .unwrap();
    assert!(events.next().await.is_none());

    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x88);
    assert_eq!(payload, vec![0x03, 0xE8]);
    assert_eq!(session.closed().await, CloseReason::RemoteClosing);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.listener.stop().await;
}

/// Draft-00 handshake with the challenge, then end-mark text frames both ways.
#[tokio::test]
async fn test_hybi00_session_over_tcp() {
    let mut server = server(ConnectionOptions::default(), WebSocketOptions::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let (session, mut events) = server.sessions.recv().await.unwrap();

    client
        .write_all(
            b"GET /demo HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\n\
Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\nUpgrade: WebSocket\r\n\
Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\nOrigin: http://example.com\r\n\r\n^n:ds[4U",
        )
        .await
        .unwrap();
    let Some(WebSocketEvent::Opened(info)) = events.next().await else {
        panic!("expected the session to open");
    };
    assert_eq!(info.version, WebSocketVersion::Hybi00);

    let head = read_http_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 WebSocket Protocol Handshake\r\n"));
    let mut challenge = [0u8; 16];
    client.read_exact(&mut challenge).await.unwrap();
    assert_eq!(&challenge, b"8jKS'y:G*Co,Wxa-");

    client.write_all(b"\x00ping\xff").await.unwrap();
    let Some(WebSocketEvent::Message(message)) = events.next().await else {
        panic!("expected a message");
    };
    assert_eq!(message.as_text(), Some("ping"));

    session.send_text("pong").await.unwrap();
    let mut frame = [0u8; 6];
    client.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame, b"\x00pong\xff");

    client.write_all(b"\xff\x00").await.unwrap();
    assert!(events.next().await.is_none());
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"\xff\x00");
    assert_eq!(session.closed().await, CloseReason::RemoteClosing);

    server.listener.stop().await;
}

/// Byte-at-a-time delivery produces the same events as whole frames.
#[tokio::test]
async fn test_byte_at_a_time_session() {
    let options = Arc::new(WebSocketOptions::default());
    let (local, mut remote) = duplex(4096);
    let channel = Channel::from_stream(
        local,
        WebSocketFilter::chain(options.clone()),
        ConnectionOptions::default(),
    )
    .unwrap();
    let session = WebSocketSession::new(channel, options);
    let mut events = session.start().unwrap();

    let mut input = UPGRADE_13.to_vec();
    let mut encoder = WebSocketMaskedEncoder::new(3);
    let mut frames = BytesMut::new();
    encoder
        .encode(&mut frames, &WebSocketMessage::text("fragmented text"))
        .unwrap();
    encoder
        .encode(&mut frames, &WebSocketMessage::binary(Bytes::from_static(&[1, 2, 3])))
        .unwrap();
    input.extend_from_slice(&frames);

    let feeder = tokio::spawn(async move {
        for byte in input {
            remote.write_all(&[byte]).await.unwrap();
        }
        remote
    });

    assert!(matches!(events.next().await, Some(WebSocketEvent::Opened(_))));
    let Some(WebSocketEvent::Message(text)) = events.next().await else {
        panic!("expected text");
    };
    assert_eq!(text.as_text(), Some("fragmented text"));
    let Some(WebSocketEvent::Message(binary)) = events.next().await else {
        panic!("expected binary");
    };
    assert_eq!(&binary.data[..], &[1, 2, 3]);

    let _remote = feeder.await.unwrap();
    session.close(CloseReason::LocalClosing).await;
}

/// A server wiring sessions into a container and a handshake monitor.
#[tokio::test]
async fn test_sessions_registered_and_monitored() {
    let options = Arc::new(WebSocketOptions::default());
    let container: SessionContainer<WebSocketSession> = SessionContainer::new();
    let monitor = HandshakeMonitor::new(options.clone());

    let (local, mut remote) = duplex(4096);
    let channel = Channel::from_stream(
        local,
        WebSocketFilter::chain(options.clone()),
        ConnectionOptions::default(),
    )
    .unwrap();
    let session = WebSocketSession::new(channel, options);
    container.insert(session.id().to_string(), session.clone());
    monitor.track(&session);
    let mut events = session.start().unwrap();

    remote.write_all(UPGRADE_13).await.unwrap();
    assert!(matches!(events.next().await, Some(WebSocketEvent::Opened(_))));
    assert_eq!(monitor.sweep(), 0);
    assert_eq!(monitor.open_pending(), 0);

    let found = container.get(&session.id().to_string()).unwrap();
    assert!(found.is_open());

    found.close_with_handshake(1001, "going away").await.unwrap();
    assert_eq!(monitor.close_pending(), 1);
    read_http_head(&mut remote).await;
    let (first, payload) = read_frame(&mut remote).await;
    assert_eq!(first, 0x88);
    assert_eq!(&payload[..2], &[0x03, 0xE9]);

    remote
        .write_all(&client_frame(true, OpCode::Close, &payload[..2]))
        .await
        .unwrap();
    assert!(events.next().await.is_none());
    assert_eq!(session.closed().await, CloseReason::LocalClosing);

    assert_eq!(monitor.sweep(), 0);
    assert_eq!(monitor.close_pending(), 0);
    container.remove(&session.id().to_string());
    assert!(container.is_empty());
}
