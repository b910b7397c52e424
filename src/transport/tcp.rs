//! TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AcceptHandler, Connection};
use crate::error::{Result, SockwireError};
use crate::options::ListenOptions;

/// Pause after an unexpected accept error before accepting again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Accepts TCP connections and hands each to an [`AcceptHandler`].
pub struct TcpConnectionListener {
    options: Arc<ListenOptions>,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl TcpConnectionListener {
    pub fn new(options: ListenOptions) -> Self {
        Self {
            options: Arc::new(options),
            running: None,
        }
    }

    pub fn options(&self) -> &ListenOptions {
        &self.options
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start<H>(&mut self, on_accept: H) -> Result<SocketAddr>
    where
        H: Fn(Arc<ListenOptions>, Connection) + Send + Sync + 'static,
    {
        if self.running.is_some() {
            return Err(SockwireError::AlreadyRunning);
        }

        let listener = bind(&self.options)?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            self.options.clone(),
            Arc::new(on_accept),
            cancel.clone(),
        ));

        tracing::info!(addr = %local_addr, "TCP listener started");
        self.running = Some(Running {
            cancel,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// Connections already handed out are not affected.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "TCP accept loop panicked");
        }
        tracing::info!(addr = %running.local_addr, "TCP listener stopped");
    }
}

fn bind(options: &ListenOptions) -> Result<TcpListener> {
    let addr = options.to_socket_addr();
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(options.backlog)?)
}

async fn accept_loop(
    listener: TcpListener,
    options: Arc<ListenOptions>,
    on_accept: AcceptHandler,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                if options.no_delay {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%remote, error = %e, "set_nodelay failed");
                    }
                }
                tracing::debug!(%remote, "accepted TCP connection");
                on_accept(options.clone(), Connection::tcp(stream, remote));
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::error!(error = %e, "TCP accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
