//! WebSocket echo server.
//!
//! This example demonstrates:
//! - Accepting TCP connections and wrapping each in a [`WebSocketSession`]
//! - Tracking handshake deadlines with a [`HandshakeMonitor`]
//! - Keeping live sessions in a [`SessionContainer`]
//!
//! # Running
//!
//! ```text
//! RUST_LOG=sockwire=debug cargo run --example echo_server
//! ```
//!
//! Then connect with any WebSocket client to `ws://127.0.0.1:2012/`.

use std::sync::Arc;

use sockwire::options::{ConnectionOptions, ListenOptions, WebSocketOptions};
use sockwire::transport::{ChannelCreator, TcpConnectionListener};
use sockwire::websocket::{HandshakeMonitor, WebSocketEvent, WebSocketFilter, WebSocketSession};
use sockwire::SessionContainer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let websocket = Arc::new(WebSocketOptions::default());
    let chain_options = websocket.clone();
    let creator = ChannelCreator::new(ConnectionOptions::default(), move || {
        WebSocketFilter::chain(chain_options.clone())
    })?;

    let mut monitor = HandshakeMonitor::new(websocket.clone());
    monitor.start()?;
    let monitor = Arc::new(monitor);

    let sessions = SessionContainer::<WebSocketSession>::new();
    let mut listener = TcpConnectionListener::new(ListenOptions {
        port: 2012,
        ..ListenOptions::default()
    });

    let registry = sessions.clone();
    let watcher = monitor.clone();
    let addr = listener
        .start(move |_, connection| {
            let session = WebSocketSession::new(creator.create(connection), websocket.clone());
            let mut events = match session.start() {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "session failed to start");
                    return;
                }
            };
            watcher.track(&session);

            let id = session.id().to_string();
            registry.insert(id.clone(), session.clone());
            let registry = registry.clone();

            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let result = match event {
                        WebSocketEvent::Opened(info) => {
                            tracing::info!(session = %id, version = %info.version, "connected");
                            Ok(())
                        }
                        WebSocketEvent::Rejected(_) => break,
                        WebSocketEvent::Message(message) if !message.is_control() => {
                            session.send(&message).await
                        }
                        WebSocketEvent::Message(_) => Ok(()),
                    };
                    if let Err(e) = result {
                        tracing::debug!(session = %id, error = %e, "echo failed");
                        break;
                    }
                }
                let reason = session.close(sockwire::CloseReason::RemoteClosing).await;
                registry.remove(&id);
                tracing::info!(session = %id, reason = %reason, "disconnected");
            });
        })
        .await?;

    tracing::info!(%addr, "echo server listening");
    tokio::signal::ctrl_c().await?;

    listener.stop().await;
    for session in sessions.sessions() {
        let _ = session.close_with_handshake(1001, "server shutting down").await;
    }
    if let Ok(mut monitor) = Arc::try_unwrap(monitor) {
        monitor.stop().await;
    }
    Ok(())
}
