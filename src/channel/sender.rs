//! Send queue and drain loop.
//!
//! Senders push finished chunks into an mpsc queue; one drain task per
//! channel writes them to the transport, batching whatever is ready into a
//! single vectored write.
//!
//! ```text
//! send()  ─┐
//! reply   ─┼─► mpsc::Sender<Bytes> ─► drain loop ─► transport
//! send()  ─┘
//! ```
//!
//! When the channel is cancelled the drain loop stops taking new work,
//! writes what was already queued (bounded by [`CLOSE_FLUSH_TIMEOUT`]) and
//! shuts the write side down.

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backpressure::BackpressureController;
use super::Activity;
use crate::error::{Result, SockwireError};
use crate::options::ConnectionOptions;

/// Maximum chunks to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// How long queued chunks may take to flush once the channel is closing.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Producer side of a channel's outbound queue.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::Sender<Bytes>,
    backpressure: BackpressureController,
}

impl SendQueue {
    /// Create the queue and the receiver its drain loop consumes.
    pub(crate) fn new(options: &ConnectionOptions) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(options.send_queue_capacity);
        let backpressure =
            BackpressureController::new(options.max_pending_sends, options.send_timeout());
        (Self { tx, backpressure }, rx)
    }

    /// Queue a chunk, waiting if backpressure is active.
    pub async fn push(&self, chunk: Bytes) -> Result<()> {
        self.backpressure.reserve().await?;
        self.tx.send(chunk).await.map_err(|_| {
            self.backpressure.release();
            SockwireError::ChannelClosed
        })
    }

    /// Queue a chunk without waiting.
    pub fn try_push(&self, chunk: Bytes) -> Result<()> {
        self.backpressure.try_reserve()?;
        self.tx.try_send(chunk).map_err(|e| {
            self.backpressure.release();
            match e {
                mpsc::error::TrySendError::Full(_) => SockwireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => SockwireError::ChannelClosed,
            }
        })
    }

    /// Chunks queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    pub(crate) fn backpressure(&self) -> BackpressureController {
        self.backpressure.clone()
    }
}

/// Write queued chunks to `writer` until the queue closes or `cancel` fires.
pub(crate) async fn drain_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    backpressure: BackpressureController,
    cancel: CancellationToken,
    activity: Arc<Activity>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(chunk) => batch.push(chunk),
                Err(_) => break,
            }
        }

        let written = tokio::select! {
            _ = cancel.cancelled() => {
                // The transport is being torn down mid-write.
                backpressure.release_many(batch.len());
                return Ok(());
            }
            result = write_batch(&mut writer, &batch) => result,
        };
        backpressure.release_many(batch.len());
        batch.clear();
        written?;
        activity.touch();
    }

    rx.close();
    while let Ok(chunk) = rx.try_recv() {
        batch.push(chunk);
    }
    if !batch.is_empty() {
        let count = batch.len();
        let flushed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, write_batch(&mut writer, &batch)).await;
        backpressure.release_many(count);
        if let Ok(Err(e)) = flushed {
            tracing::debug!(dropped = count, error = %e, "queued chunks dropped on close");
        }
    }

    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer.shutdown()).await;
    Ok(())
}

/// Write a batch of chunks using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(SockwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut start = 0;

    for chunk in batch {
        let end = start + chunk.len();
        if skip_bytes < end && !chunk.is_empty() {
            let offset = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&chunk[offset..]));
        }
        start = end;
    }

    slices
}
