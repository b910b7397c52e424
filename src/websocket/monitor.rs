//! Open- and close-handshake deadlines.
//!
//! Sessions enter the open queue when tracked and the close queue when they
//! send a close frame. A periodic sweep drops sessions that finished the step
//! and force-closes the ones past their deadline with [`CloseReason::TimeOut`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::WebSocketSession;
use crate::channel::CloseReason;
use crate::error::{Result, SockwireError};
use crate::options::WebSocketOptions;

fn lock(queue: &Mutex<VecDeque<WebSocketSession>>) -> MutexGuard<'_, VecDeque<WebSocketSession>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The two pending queues shared between the monitor and its sessions.
#[derive(Debug, Default)]
pub struct PendingQueues {
    open: Mutex<VecDeque<WebSocketSession>>,
    close: Mutex<VecDeque<WebSocketSession>>,
}

impl PendingQueues {
    pub(crate) fn push_open(&self, session: WebSocketSession) {
        lock(&self.open).push_back(session);
    }

    pub(crate) fn push_close(&self, session: WebSocketSession) {
        lock(&self.close).push_back(session);
    }

    fn sweep(&self, now: Instant, open_timeout: Duration, close_timeout: Duration) -> usize {
        let mut forced = 0;

        lock(&self.open).retain(|session| {
            if session.is_closed() || !session.is_handshake_pending() {
                return false;
            }
            if now.saturating_duration_since(session.handshake_started()) < open_timeout {
                return true;
            }
            warn!(session_id = session.id(), "opening handshake timed out");
            session.force_close(CloseReason::TimeOut);
            forced += 1;
            false
        });

        lock(&self.close).retain(|session| {
            if session.is_closed() {
                return false;
            }
            let Some(started) = session.close_started() else {
                return false;
            };
            if now.saturating_duration_since(started) < close_timeout {
                return true;
            }
            warn!(session_id = session.id(), "closing handshake timed out");
            session.force_close(CloseReason::TimeOut);
            forced += 1;
            false
        });

        forced
    }
}

/// Enforces the WebSocket handshake timeouts.
pub struct HandshakeMonitor {
    queues: Arc<PendingQueues>,
    options: Arc<WebSocketOptions>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl HandshakeMonitor {
    pub fn new(options: Arc<WebSocketOptions>) -> Self {
        Self {
            queues: Arc::new(PendingQueues::default()),
            options,
            running: None,
        }
    }

    /// Watch `session` for its opening handshake, and later its closing one.
    pub fn track(&self, session: &WebSocketSession) {
        session.attach_monitor(Arc::downgrade(&self.queues));
        self.queues.push_open(session.clone());
    }

    /// Sessions waiting for their opening handshake.
    pub fn open_pending(&self) -> usize {
        lock(&self.queues.open).len()
    }

    /// Sessions waiting for the peer's close frame.
    pub fn close_pending(&self) -> usize {
        lock(&self.queues.close).len()
    }

    /// Sweep both queues now. Returns the number of sessions force-closed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        self.queues.sweep(
            now,
            self.options.open_handshake_timeout(),
            self.options.close_handshake_timeout(),
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Sweep periodically on the options' interval until [`stop`](Self::stop).
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(SockwireError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let queues = self.queues.clone();
        let options = self.options.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(options.handshake_sweep_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let forced = queues.sweep(
                            Instant::now(),
                            options.open_handshake_timeout(),
                            options.close_handshake_timeout(),
                        );
                        if forced > 0 {
                            debug!(forced, "handshake sweep closed sessions");
                        }
                    }
                }
            }
        });

        self.running = Some((cancel, task));
        Ok(())
    }

    pub async fn stop(&mut self) {
        let Some((cancel, task)) = self.running.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = task.await {
            tracing::error!(error = %e, "handshake sweep task panicked");
        }
    }
}
