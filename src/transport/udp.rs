//! UDP datagram demultiplexing into virtual connections.
//!
//! One socket serves every peer. Each datagram is mapped to a session key by
//! a [`SessionIdFn`]; datagrams for a key that already has a live virtual
//! connection are routed to it, any other key produces a new connection.
//!
//! ```text
//! UdpSocket ─► recv loop ─► session_id(addr, datagram)
//!                               │
//!                 known key ────┼──► mpsc ─► UdpVirtualReader (existing channel)
//!                 new key   ────┴──► new Connection ─► AcceptHandler
//! ```

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AcceptHandler, Connection};
use crate::error::{is_ignorable_io, Result, SockwireError};
use crate::options::ListenOptions;

/// Datagrams buffered per virtual connection before new ones are dropped.
pub const UDP_SESSION_QUEUE_CAPACITY: usize = 256;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Maps `(remote endpoint, datagram)` to a stable session key.
pub type SessionIdFn = Arc<dyn Fn(SocketAddr, &[u8]) -> String + Send + Sync>;

type Routes = Arc<DashMap<String, mpsc::Sender<Bytes>>>;

/// Session key by remote endpoint.
pub fn default_session_id(remote: SocketAddr, _datagram: &[u8]) -> String {
    remote.to_string()
}

/// Read half of a UDP virtual connection.
///
/// Yields the bytes of routed datagrams in arrival order and reports EOF
/// once the listener stops. Dropping it unregisters the session.
pub struct UdpVirtualReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    key: String,
    routes: Routes,
}

impl AsyncRead for UdpVirtualReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.current.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(datagram)) => self.current = datagram,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let take = self.current.len().min(buf.remaining());
        buf.put_slice(&self.current[..take]);
        self.current.advance(take);
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpVirtualReader {
    fn drop(&mut self) {
        self.routes.remove(&self.key);
    }
}

/// Write half of a UDP virtual connection; every write is one datagram.
pub struct UdpVirtualWriter {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl AsyncWrite for UdpVirtualWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send_to(cx, buf, self.remote)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Receives datagrams and turns new sessions into connections.
pub struct UdpConnectionListener {
    options: Arc<ListenOptions>,
    session_id: SessionIdFn,
    routes: Routes,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl UdpConnectionListener {
    pub fn new(options: ListenOptions) -> Self {
        Self {
            options: Arc::new(options),
            session_id: Arc::new(default_session_id),
            routes: Arc::new(DashMap::new()),
            running: None,
        }
    }

    /// Use a custom session-identifier function.
    pub fn with_session_id<S>(mut self, session_id: S) -> Self
    where
        S: Fn(SocketAddr, &[u8]) -> String + Send + Sync + 'static,
    {
        self.session_id = Arc::new(session_id);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Number of live virtual connections.
    pub fn session_count(&self) -> usize {
        self.routes.len()
    }

    /// Bind and start receiving. Returns the bound address.
    pub async fn start<H>(&mut self, on_accept: H) -> Result<SocketAddr>
    where
        H: Fn(Arc<ListenOptions>, Connection) + Send + Sync + 'static,
    {
        if self.running.is_some() {
            return Err(SockwireError::AlreadyRunning);
        }

        let socket = Arc::new(UdpSocket::bind(self.options.to_socket_addr()).await?);
        let local_addr = socket.local_addr()?;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(recv_loop(
            socket,
            self.options.clone(),
            self.session_id.clone(),
            self.routes.clone(),
            Arc::new(on_accept),
            cancel.clone(),
        ));

        tracing::info!(addr = %local_addr, "UDP listener started");
        self.running = Some(Running {
            cancel,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop receiving. Virtual connections see EOF.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "UDP receive loop panicked");
        }
        self.routes.clear();
        tracing::info!(addr = %running.local_addr, "UDP listener stopped");
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    options: Arc<ListenOptions>,
    session_id: SessionIdFn,
    routes: Routes,
    on_accept: AcceptHandler,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, remote) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP port-unreachable surfaces as a reset on some platforms.
                if is_ignorable_io(&e) {
                    tracing::debug!(error = %e, "UDP receive error");
                } else {
                    tracing::error!(error = %e, "UDP receive error");
                }
                continue;
            }
        };

        let mut datagram = Bytes::copy_from_slice(&buf[..len]);
        let key = session_id(remote, &datagram);

        let existing = routes.get(&key).map(|entry| entry.value().clone());
        if let Some(tx) = existing {
            match tx.try_send(datagram) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(session = %key, "UDP session queue full, datagram dropped");
                    continue;
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    routes.remove(&key);
                    datagram = returned;
                }
            }
        }

        let (tx, rx) = mpsc::channel(UDP_SESSION_QUEUE_CAPACITY);
        let _ = tx.try_send(datagram);
        routes.insert(key.clone(), tx);

        let reader = UdpVirtualReader {
            rx,
            current: Bytes::new(),
            key: key.clone(),
            routes: routes.clone(),
        };
        let writer = UdpVirtualWriter {
            socket: socket.clone(),
            remote,
        };

        tracing::debug!(%remote, session = %key, "new UDP session");
        on_accept(options.clone(), Connection::udp(reader, writer, remote, key));
    }
}
