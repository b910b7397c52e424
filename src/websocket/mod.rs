//! WebSocket protocol layer.
//!
//! - [`WebSocketFilter`]: handshake negotiation (RFC 6455, hybi-10, hybi-00)
//!   followed by frame decoding, as one pipeline filter
//! - [`encoder`]: outbound framing per version, with fragmentation
//! - [`WebSocketSession`]: state machine answering pings and close frames
//! - [`HandshakeMonitor`]: opening/closing handshake deadlines
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sockwire::channel::Channel;
//! use sockwire::options::{ConnectionOptions, WebSocketOptions};
//! use sockwire::websocket::{WebSocketEvent, WebSocketFilter, WebSocketSession};
//!
//! # async fn demo(stream: tokio::net::TcpStream) -> sockwire::error::Result<()> {
//! let options = Arc::new(WebSocketOptions::default());
//! let channel = Channel::from_stream(
//!     stream,
//!     WebSocketFilter::chain(options.clone()),
//!     ConnectionOptions::default(),
//! )?;
//! let session = WebSocketSession::new(channel, options);
//! let mut events = session.start()?;
//! while let Some(event) = events.next().await {
//!     if let WebSocketEvent::Message(message) = event {
//!         if let Some(text) = message.as_text() {
//!             session.send_text(text).await?;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod encoder;
pub mod frame;
pub mod handshake;

mod filter;
mod monitor;
mod session;

pub use encoder::{Hybi00Encoder, VersionedEncoder, WebSocketEncoder, WebSocketMaskedEncoder};
pub use filter::{WebSocketContext, WebSocketFilter, WebSocketPackage};
pub use frame::{CloseStatus, OpCode, WebSocketMessage};
pub use handshake::{HandshakeInfo, HandshakeRequest, WebSocketVersion};
pub use monitor::{HandshakeMonitor, PendingQueues};
pub use session::{WebSocketEvent, WebSocketEvents, WebSocketSession, WebSocketState};
