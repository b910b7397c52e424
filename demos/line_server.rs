//! Line echo server - the smallest channel setup.
//!
//! Every `\r\n`-terminated line a client sends is written back to it.
//! Options can be supplied as JSON:
//!
//! ```text
//! cargo run --example line_server -- '{"port": 2020}'
//! printf 'hello\r\n' | nc 127.0.0.1 2020
//! ```

use sockwire::options::{ConnectionOptions, ListenOptions};
use sockwire::protocol::{FilterChain, LineEncoder, LineFilter};
use sockwire::transport::{ChannelCreator, TcpConnectionListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let listen = match std::env::args().nth(1) {
        Some(json) => ListenOptions::from_json(&json)?,
        None => ListenOptions {
            port: 2020,
            ..ListenOptions::default()
        },
    };

    let creator = ChannelCreator::new(ConnectionOptions::default(), || {
        FilterChain::new(LineFilter::new(), ())
    })?;

    let mut listener = TcpConnectionListener::new(listen);
    let addr = listener
        .start(move |_, connection| {
            let channel = creator.create(connection);
            tokio::spawn(async move {
                let mut lines = channel.run()?;
                let mut encoder = LineEncoder::default();
                while let Some(line) = lines.next().await {
                    channel.send_package(&mut encoder, line.as_str()).await?;
                }
                let reason = channel.closed().await;
                tracing::debug!(channel = channel.id(), reason = %reason, "line channel closed");
                sockwire::Result::Ok(())
            });
        })
        .await?;

    tracing::info!(%addr, "line server listening");
    tokio::signal::ctrl_c().await?;
    listener.stop().await;
    Ok(())
}
