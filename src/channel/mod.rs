//! Channel engine - one duplex, backpressure-aware byte pipe per connection.
//!
//! A [`Channel`] owns a transport split into read and write halves and runs
//! three tasks once started:
//!
//! ```text
//! transport ─► fill loop ─► PipelineBuffer ─► packages ─► PackageStream
//!                              │ replies
//!                              ▼
//! send()/send_package() ─► SendQueue ─► drain loop ─► transport
//!
//! supervisor: awaits both loops, records the close reason, fires `closed`
//! ```
//!
//! Closing is cooperative. [`Channel::close`] records the reason (the first
//! recorded reason wins), cancels the channel's token and waits until both
//! loops have exited. The close signal fires exactly once.
//!
//! # Example
//!
//! ```no_run
//! use sockwire::channel::{Channel, CloseReason};
//! use sockwire::options::ConnectionOptions;
//! use sockwire::protocol::{FilterChain, LineFilter};
//!
//! # async fn demo(stream: tokio::net::TcpStream) -> sockwire::error::Result<()> {
//! let channel = Channel::from_stream(
//!     stream,
//!     FilterChain::new(LineFilter::new(), ()),
//!     ConnectionOptions::default(),
//! )?;
//! let mut packages = channel.run()?;
//! while let Some(line) = packages.next().await {
//!     channel.send(format!("{line}\r\n").into()).await?;
//! }
//! channel.close(CloseReason::LocalClosing).await;
//! # Ok(())
//! # }
//! ```

mod backpressure;
mod sender;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{is_ignorable_io, Result, SockwireError};
use crate::options::ConnectionOptions;
use crate::protocol::{Decoded, FilterChain, PackageEncoder, PipelineBuffer, PipelineFilter};

pub use backpressure::BackpressureController;
pub use sender::{SendQueue, CLOSE_FLUSH_TIMEOUT};

/// Capacity of the decoded package queue between fill loop and consumer.
pub const PACKAGE_QUEUE_CAPACITY: usize = 64;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Why a channel stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The local side asked to close.
    LocalClosing,
    /// The peer hung up.
    RemoteClosing,
    /// The peer violated the protocol.
    ProtocolError,
    /// The transport failed.
    SocketError,
    /// A handshake or idle deadline passed.
    TimeOut,
    Unknown,
}

impl CloseReason {
    fn to_u8(self) -> u8 {
        match self {
            Self::LocalClosing => 1,
            Self::RemoteClosing => 2,
            Self::ProtocolError => 3,
            Self::SocketError => 4,
            Self::TimeOut => 5,
            Self::Unknown => 6,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::LocalClosing),
            2 => Some(Self::RemoteClosing),
            3 => Some(Self::ProtocolError),
            4 => Some(Self::SocketError),
            5 => Some(Self::TimeOut),
            6 => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalClosing => "local-closing",
            Self::RemoteClosing => "remote-closing",
            Self::ProtocolError => "protocol-error",
            Self::SocketError => "socket-error",
            Self::TimeOut => "timeout",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Last-activity clock shared by the fill and drain loops.
#[derive(Debug)]
pub(crate) struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

struct Shared {
    id: u64,
    remote_addr: OnceLock<SocketAddr>,
    cancel: CancellationToken,
    reason: AtomicU8,
    closed_tx: watch::Sender<Option<CloseReason>>,
    activity: Arc<Activity>,
    started: AtomicBool,
}

impl Shared {
    /// Record `reason` unless one was recorded already.
    fn record(&self, reason: CloseReason) -> bool {
        self.reason
            .compare_exchange(0, reason.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn recorded(&self) -> Option<CloseReason> {
        CloseReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    /// Fire the close signal (once).
    fn finish(&self) {
        let reason = self.recorded().unwrap_or(CloseReason::Unknown);
        let fired = self.closed_tx.send_if_modified(|value| {
            if value.is_none() {
                *value = Some(reason);
                true
            } else {
                false
            }
        });
        if fired {
            info!(channel_id = self.id, %reason, "channel closed");
        }
    }
}

/// Transport halves and pipeline parts waiting for `start()`.
struct Pending<F: PipelineFilter> {
    reader: BoxedReader,
    writer: BoxedWriter,
    chain: FilterChain<F>,
    outbound: mpsc::Receiver<Bytes>,
    packages: mpsc::Sender<F::Package>,
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Cloneable handle for writing to a channel.
///
/// All sends go through one async lock, so two sends never interleave and
/// reach the transport in the order they acquired the lock.
#[derive(Clone)]
pub struct ChannelSender {
    shared: Arc<Shared>,
    queue: SendQueue,
    scratch: Arc<tokio::sync::Mutex<BytesMut>>,
}

impl ChannelSender {
    fn ensure_open(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(SockwireError::ChannelClosed);
        }
        Ok(())
    }

    /// Send raw bytes.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.scratch.lock().await;
        self.queue.push(data).await
    }

    /// Encode `package` with `encoder` and send it.
    pub async fn send_package<P, E>(&self, encoder: &mut E, package: &P) -> Result<()>
    where
        P: ?Sized,
        E: PackageEncoder<P>,
    {
        self.send_with(|buf| encoder.encode(buf, package).map(|_| ()))
            .await
    }

    /// Let `write` fill the outbound buffer, then send what it wrote.
    pub async fn send_with<R, W>(&self, write: W) -> Result<R>
    where
        W: FnOnce(&mut BytesMut) -> Result<R>,
    {
        self.ensure_open()?;
        let mut scratch = self.scratch.lock().await;
        let value = match write(&mut scratch) {
            Ok(value) => value,
            Err(e) => {
                scratch.clear();
                return Err(e);
            }
        };
        let chunk = scratch.split().freeze();
        if !chunk.is_empty() {
            self.queue.push(chunk).await?;
        }
        Ok(value)
    }

    /// Chunks queued but not yet written.
    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// Stream of decoded packages returned by [`Channel::run`].
pub struct PackageStream<P> {
    rx: mpsc::Receiver<P>,
}

impl<P> PackageStream<P> {
    /// Next package in receive order, or `None` once the channel is closed
    /// and every decoded package was delivered.
    pub async fn next(&mut self) -> Option<P> {
        self.rx.recv().await
    }

    pub fn into_inner(self) -> mpsc::Receiver<P> {
        self.rx
    }
}

/// A connection's transport, filter chain and send/receive loops.
pub struct Channel<F: PipelineFilter> {
    shared: Arc<Shared>,
    sender: ChannelSender,
    options: Arc<ConnectionOptions>,
    pending: Arc<Mutex<Option<Pending<F>>>>,
    packages: Arc<Mutex<Option<mpsc::Receiver<F::Package>>>>,
}

impl<F: PipelineFilter> Clone for Channel<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            sender: self.sender.clone(),
            options: self.options.clone(),
            pending: self.pending.clone(),
            packages: self.packages.clone(),
        }
    }
}

impl<F: PipelineFilter> fmt::Debug for Channel<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("remote_addr", &self.shared.remote_addr.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<F: PipelineFilter> Channel<F> {
    /// Create a channel over separate read and write halves.
    ///
    /// Fails with [`SockwireError::Config`] if `options` do not validate.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        chain: FilterChain<F>,
        options: ConnectionOptions,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        options.validate()?;
        Ok(Self::assemble(reader, writer, chain, options))
    }

    /// Build a channel from options that were already validated.
    pub(crate) fn assemble<R, W>(
        reader: R,
        writer: W,
        chain: FilterChain<F>,
        options: ConnectionOptions,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (queue, outbound) = SendQueue::new(&options);
        let (package_tx, package_rx) = mpsc::channel(PACKAGE_QUEUE_CAPACITY);
        let (closed_tx, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr: OnceLock::new(),
            cancel: CancellationToken::new(),
            reason: AtomicU8::new(0),
            closed_tx,
            activity: Arc::new(Activity::new()),
            started: AtomicBool::new(false),
        });

        let sender = ChannelSender {
            shared: shared.clone(),
            queue,
            scratch: Arc::new(tokio::sync::Mutex::new(BytesMut::new())),
        };

        let pending = Pending {
            reader: Box::new(reader),
            writer: Box::new(writer),
            chain,
            outbound,
            packages: package_tx,
        };

        Self {
            shared,
            sender,
            options: Arc::new(options),
            pending: Arc::new(Mutex::new(Some(pending))),
            packages: Arc::new(Mutex::new(Some(package_rx))),
        }
    }

    /// Create a channel over any duplex stream.
    pub fn from_stream<S>(stream: S, chain: FilterChain<F>, options: ConnectionOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, chain, options)
    }

    /// Attach the peer address (set once).
    pub fn with_remote_addr(self, addr: SocketAddr) -> Self {
        let _ = self.shared.remote_addr.set(addr);
        self
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr.get().copied()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// A cloneable send handle.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Time of the last successful read or write.
    pub fn last_active(&self) -> Instant {
        self.shared.activity.last()
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// True once closing has begun.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Reason the channel closed, once it has fully closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.shared.closed_tx.borrow()
    }

    /// Watch the close signal. The value becomes `Some` exactly once.
    pub fn subscribe_closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.shared.closed_tx.subscribe()
    }

    /// Cancellation token fired when closing begins.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Launch the fill, drain and supervisor tasks.
    ///
    /// Must be called inside a tokio runtime. Fails with
    /// [`SockwireError::AlreadyRunning`] on a second call and
    /// [`SockwireError::ChannelClosed`] if the channel was closed first.
    pub fn start(&self) -> Result<()> {
        let Some(parts) = take(&self.pending) else {
            return Err(if self.is_closed() {
                SockwireError::ChannelClosed
            } else {
                SockwireError::AlreadyRunning
            });
        };
        self.shared.started.store(true, Ordering::Release);

        let Pending {
            reader,
            writer,
            chain,
            outbound,
            packages,
        } = parts;

        let shared = self.shared.clone();
        let drain = tokio::spawn(run_drain(
            shared.clone(),
            outbound,
            writer,
            self.sender.queue.backpressure(),
        ));

        let buffer = PipelineBuffer::from_chain(chain, self.options.max_package_length);
        let fill = tokio::spawn(fill_loop(
            shared.clone(),
            reader,
            buffer,
            packages,
            self.sender.clone(),
            self.options.receive_buffer_size,
        ));

        tokio::spawn(supervise(shared, fill, drain));
        debug!(channel_id = self.shared.id, "channel started");
        Ok(())
    }

    /// Take the package stream, starting the channel if needed.
    ///
    /// Only one consumer exists per channel; a second call fails with
    /// [`SockwireError::AlreadyRunning`].
    pub fn run(&self) -> Result<PackageStream<F::Package>> {
        let rx = take(&self.packages).ok_or(SockwireError::AlreadyRunning)?;
        match self.start() {
            Ok(()) | Err(SockwireError::AlreadyRunning) => {}
            Err(e) => return Err(e),
        }
        Ok(PackageStream { rx })
    }

    /// Send raw bytes.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.sender.send(data).await
    }

    /// Encode and send a package.
    pub async fn send_package<P, E>(&self, encoder: &mut E, package: &P) -> Result<()>
    where
        P: ?Sized,
        E: PackageEncoder<P>,
    {
        self.sender.send_package(encoder, package).await
    }

    /// Send whatever `write` puts in the outbound buffer.
    pub async fn send_with<R, W>(&self, write: W) -> Result<R>
    where
        W: FnOnce(&mut BytesMut) -> Result<R>,
    {
        self.sender.send_with(write).await
    }

    /// Begin closing without waiting for the loops to exit.
    ///
    /// Returns false if the channel was already closing.
    pub fn abort(&self, reason: CloseReason) -> bool {
        let recorded = self.shared.record(reason);
        let first = !self.shared.cancel.is_cancelled();
        self.shared.cancel.cancel();

        // Never started: nothing to wait for.
        if take(&self.pending).is_some() {
            self.shared.finish();
        }
        recorded && first
    }

    /// Close the channel and wait until it has fully closed.
    ///
    /// Idempotent: the first recorded reason is kept and returned by every call.
    pub async fn close(&self, reason: CloseReason) -> CloseReason {
        self.abort(reason);
        self.closed().await
    }

    /// Wait for the close signal.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.closed_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.unwrap_or(CloseReason::Unknown),
            Err(_) => CloseReason::Unknown,
        };
        reason
    }
}

/// Close reason for an I/O failure, logged by severity.
fn io_close_reason(channel_id: u64, err: &io::Error) -> CloseReason {
    if is_ignorable_io(err) {
        debug!(channel_id, error = %err, "peer disconnected");
        CloseReason::RemoteClosing
    } else {
        error!(channel_id, error = %err, "socket error");
        CloseReason::SocketError
    }
}

async fn fill_loop<F: PipelineFilter>(
    shared: Arc<Shared>,
    mut reader: BoxedReader,
    mut buffer: PipelineBuffer<F>,
    packages: mpsc::Sender<F::Package>,
    sender: ChannelSender,
    read_size: usize,
) -> Option<CloseReason> {
    let mut read_buf = BytesMut::with_capacity(read_size);
    let mut decoded = Vec::new();

    loop {
        read_buf.reserve(read_size);
        let read = {
            let mut limited = (&mut read_buf).limit(read_size);
            tokio::select! {
                _ = shared.cancel.cancelled() => return None,
                result = reader.read_buf(&mut limited) => result,
            }
        };

        match read {
            Ok(0) => {
                debug!(channel_id = shared.id, "remote closed the connection");
                return Some(CloseReason::RemoteClosing);
            }
            Ok(_) => {
                shared.activity.touch();
                buffer.extend(read_buf.split().freeze());
            }
            Err(e) => return Some(io_close_reason(shared.id, &e)),
        }

        let result = buffer.decode_into(&mut decoded);

        for item in decoded.drain(..) {
            match item {
                Decoded::Reply(bytes) => {
                    if sender.send(bytes).await.is_err() {
                        return None;
                    }
                }
                Decoded::Package(package) => {
                    tokio::select! {
                        _ = shared.cancel.cancelled() => return None,
                        // A dropped consumer only means nobody listens.
                        _ = packages.send(package) => {}
                    }
                }
            }
        }

        if let Err(e) = result {
            warn!(channel_id = shared.id, error = %e, "closing channel");
            return Some(e.close_reason());
        }
    }
}

async fn run_drain(
    shared: Arc<Shared>,
    outbound: mpsc::Receiver<Bytes>,
    writer: BoxedWriter,
    backpressure: BackpressureController,
) {
    let result = sender::drain_loop(
        outbound,
        writer,
        backpressure,
        shared.cancel.clone(),
        shared.activity.clone(),
    )
    .await;

    if let Err(e) = result {
        let reason = match &e {
            SockwireError::Io(io) => io_close_reason(shared.id, io),
            other => other.close_reason(),
        };
        shared.record(reason);
        shared.cancel.cancel();
    }
}

async fn supervise(
    shared: Arc<Shared>,
    fill: JoinHandle<Option<CloseReason>>,
    drain: JoinHandle<()>,
) {
    match fill.await {
        Ok(Some(reason)) => {
            shared.record(reason);
        }
        Ok(None) => {}
        Err(e) => {
            error!(channel_id = shared.id, error = %e, "fill loop panicked");
            shared.record(CloseReason::Unknown);
        }
    }
    shared.cancel.cancel();

    if let Err(e) = drain.await {
        error!(channel_id = shared.id, error = %e, "drain loop panicked");
    }
    shared.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LineEncoder, LineFilter};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn line_channel(options: ConnectionOptions) -> (Channel<LineFilter>, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let channel =
            Channel::from_stream(local, FilterChain::new(LineFilter::new(), ()), options).unwrap();
        (channel, remote)
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::ProtocolError.to_string(), "protocol-error");
        assert_eq!(CloseReason::TimeOut.to_string(), "timeout");
        for reason in [
            CloseReason::LocalClosing,
            CloseReason::RemoteClosing,
            CloseReason::ProtocolError,
            CloseReason::SocketError,
            CloseReason::TimeOut,
            CloseReason::Unknown,
        ] {
            assert_eq!(CloseReason::from_u8(reason.to_u8()), Some(reason));
        }
    }

    #[tokio::test]
    async fn test_packages_in_receive_order() {
        let (channel, mut remote) = line_channel(ConnectionOptions::default());
        let mut packages = channel.run().unwrap();

        remote.write_all(b"one\r\ntw").await.unwrap();
        remote.write_all(b"o\r\nthree\r\n").await.unwrap();

        assert_eq!(packages.next().await.unwrap(), "one");
        assert_eq!(packages.next().await.unwrap(), "two");
        assert_eq!(packages.next().await.unwrap(), "three");
    }

    #[tokio::test]
    async fn test_send_package_reaches_peer() {
        let (channel, mut remote) = line_channel(ConnectionOptions::default());
        channel.start().unwrap();

        let mut encoder = LineEncoder::default();
        channel.send_package(&mut encoder, "pong").await.unwrap();
        channel
            .send_with(|buf| {
                buf.extend_from_slice(b"raw");
                Ok(())
            })
            .await
            .unwrap();

        let mut buf = [0u8; 9];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong\r\nraw");
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_any_task() {
        for options in [
            ConnectionOptions {
                send_queue_capacity: 0,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                receive_buffer_size: 0,
                ..ConnectionOptions::default()
            },
        ] {
            let (local, _remote) = duplex(64);
            let result = Channel::from_stream(local, FilterChain::new(LineFilter::new(), ()), options);
            assert!(matches!(result, Err(SockwireError::Config(_))));
        }

        let (reader, writer) = duplex(64);
        let options = ConnectionOptions {
            max_pending_sends: 0,
            ..ConnectionOptions::default()
        };
        let result = Channel::new(reader, writer, FilterChain::new(LineFilter::new(), ()), options);
        assert!(matches!(result, Err(SockwireError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let (channel, _remote) = line_channel(ConnectionOptions::default());
        let _packages = channel.run().unwrap();
        assert!(matches!(channel.run(), Err(SockwireError::AlreadyRunning)));
        assert!(matches!(channel.start(), Err(SockwireError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_remote_eof_ends_stream() {
        let (channel, remote) = line_channel(ConnectionOptions::default());
        let mut packages = channel.run().unwrap();
        drop(remote);

        assert!(packages.next().await.is_none());
        assert_eq!(channel.closed().await, CloseReason::RemoteClosing);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, _remote) = line_channel(ConnectionOptions::default());
        channel.start().unwrap();
        let mut closed = channel.subscribe_closed();

        let first = channel.close(CloseReason::LocalClosing).await;
        let second = channel.close(CloseReason::TimeOut).await;

        assert_eq!(first, CloseReason::LocalClosing);
        assert_eq!(second, CloseReason::LocalClosing);
        assert!(closed.has_changed().unwrap());
        closed.borrow_and_update();
        assert!(!closed.has_changed().unwrap());
        assert_eq!(channel.close_reason(), Some(CloseReason::LocalClosing));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (channel, _remote) = line_channel(ConnectionOptions::default());
        channel.start().unwrap();
        channel.close(CloseReason::LocalClosing).await;

        let result = channel.send(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(SockwireError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let (channel, _remote) = line_channel(ConnectionOptions::default());
        assert_eq!(channel.close(CloseReason::LocalClosing).await, CloseReason::LocalClosing);
        assert!(matches!(channel.start(), Err(SockwireError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_oversized_package_closes_with_protocol_error() {
        let options = ConnectionOptions::default().with_max_package_length(8);
        let (channel, mut remote) = line_channel(options);
        let mut packages = channel.run().unwrap();

        remote.write_all(b"ok\r\nthis line is too long\r\n").await.unwrap();

        assert_eq!(packages.next().await.unwrap(), "ok");
        assert!(packages.next().await.is_none());
        assert_eq!(channel.closed().await, CloseReason::ProtocolError);
    }

    #[tokio::test]
    async fn test_last_active_advances_on_read() {
        let (channel, mut remote) = line_channel(ConnectionOptions::default());
        let before = channel.last_active();
        let mut packages = channel.run().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.write_all(b"x\r\n").await.unwrap();
        packages.next().await.unwrap();

        assert!(channel.last_active() > before);
    }
}
