//! # sockwire
//!
//! Socket-server building blocks: per-connection channels that turn a byte
//! stream into packages through a pipeline filter chain, and a WebSocket
//! protocol layer built on top of them.
//!
//! ## Architecture
//!
//! - **Listeners** (TCP, UDP): accept transports and hand out [`transport::Connection`]s
//! - **Channel**: fill loop -> filter chain -> package stream; send queue -> drain loop
//! - **Filters**: incremental decoders that may hand off to a successor filter
//! - **WebSocket**: handshake negotiation across drafts, then frame decoding
//!
//! ## Example
//!
//! ```ignore
//! use sockwire::options::{ConnectionOptions, ListenOptions};
//! use sockwire::protocol::{FilterChain, LineFilter};
//! use sockwire::transport::{ChannelCreator, TcpConnectionListener};
//!
//! #[tokio::main]
//! async fn main() -> sockwire::Result<()> {
//!     let creator = ChannelCreator::new(ConnectionOptions::default(), || {
//!         FilterChain::new(LineFilter::new(), ())
//!     })?;
//!
//!     let mut listener = TcpConnectionListener::new(ListenOptions::default());
//!     listener
//!         .start(move |_, connection| {
//!             let channel = creator.create(connection);
//!             tokio::spawn(async move {
//!                 let mut lines = channel.run()?;
//!                 while let Some(line) = lines.next().await {
//!                     channel.send(format!("{line}\r\n").into()).await?;
//!                 }
//!                 sockwire::Result::Ok(())
//!             });
//!         })
//!         .await?;
//!     tokio::signal::ctrl_c().await?;
//!     listener.stop().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
pub mod options;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod websocket;

pub use channel::{Channel, ChannelSender, CloseReason, PackageStream};
pub use error::{Result, SockwireError};
pub use options::{ConnectionOptions, ListenOptions, WebSocketOptions};
pub use session::SessionContainer;
