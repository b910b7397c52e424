//! Outbound backpressure.
//!
//! Every chunk handed to a channel's send queue takes one slot; the drain
//! loop gives slots back once the bytes reach the transport. With
//! `max_pending` slots taken, senders park until a release wakes them and
//! fail with [`SockwireError::BackpressureTimeout`] once the timeout passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{Result, SockwireError};

#[derive(Debug, Default)]
struct Slots {
    taken: AtomicUsize,
    freed: Notify,
}

/// Shared count of chunks queued but not yet written.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    slots: Arc<Slots>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Slots::default()),
            max_pending,
            timeout,
        }
    }

    /// True while every slot is taken.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.slots.taken.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Take a slot without waiting.
    pub fn try_reserve(&self) -> Result<()> {
        self.slots
            .taken
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < self.max_pending).then_some(taken + 1)
            })
            .map(|_| ())
            .map_err(|_| SockwireError::BackpressureTimeout)
    }

    /// Take a slot, parking until one is released or the timeout passes.
    pub async fn reserve(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            // Register before checking so a release in between is not missed.
            let freed = self.slots.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.try_reserve().is_ok() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return self.try_reserve();
            }
        }
    }

    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Give back the slots of a written batch.
    pub fn release_many(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.slots.taken.fetch_sub(count, Ordering::Release);
        self.slots.freed.notify_waiters();
    }
}
