//! Transport module - accepted connections and the listeners producing them.
//!
//! Provides:
//! - [`TcpConnectionListener`]: one socket per connection
//! - [`UdpConnectionListener`]: datagrams demultiplexed into virtual connections
//! - [`Connection`]: transport halves plus addressing, ready to become a channel
//! - [`ChannelCreator`]: binds connection options and a filter factory

mod creator;
mod tcp;
mod udp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::channel::{BoxedReader, BoxedWriter, Channel};
use crate::error::Result;
use crate::options::{ConnectionOptions, ListenOptions};
use crate::protocol::{FilterChain, PipelineFilter};

pub use creator::{ChannelCreator, FilterFactory};
pub use tcp::TcpConnectionListener;
pub use udp::{
    default_session_id, SessionIdFn, UdpConnectionListener, UdpVirtualReader, UdpVirtualWriter,
    UDP_SESSION_QUEUE_CAPACITY,
};

/// Callback invoked for every accepted connection.
pub type AcceptHandler = Arc<dyn Fn(Arc<ListenOptions>, Connection) + Send + Sync>;

/// Kind of transport behind a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    /// Host-provided duplex stream.
    Stream,
}

/// An accepted transport, not yet bound to a filter chain.
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
    kind: TransportKind,
    remote_addr: Option<SocketAddr>,
    session_key: Option<String>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .field("session_key", &self.session_key)
            .finish()
    }
}

impl Connection {
    /// Wrap an accepted TCP stream.
    pub fn tcp(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            kind: TransportKind::Tcp,
            remote_addr: Some(remote_addr),
            session_key: None,
        }
    }

    /// Wrap any duplex stream supplied by the host.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            kind: TransportKind::Stream,
            remote_addr: None,
            session_key: None,
        }
    }

    pub(crate) fn udp(
        reader: UdpVirtualReader,
        writer: UdpVirtualWriter,
        remote_addr: SocketAddr,
        session_key: String,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            kind: TransportKind::Udp,
            remote_addr: Some(remote_addr),
            session_key: Some(session_key),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Session identifier of a UDP virtual connection.
    pub fn session_key(&self) -> Option<&str> {
        self.session_key.as_deref()
    }

    /// Bind this connection to a filter chain.
    ///
    /// Fails with [`SockwireError::Config`](crate::error::SockwireError::Config)
    /// if `options` do not validate.
    pub fn into_channel<F: PipelineFilter>(
        self,
        chain: FilterChain<F>,
        options: ConnectionOptions,
    ) -> Result<Channel<F>> {
        options.validate()?;
        Ok(self.bind(chain, options))
    }

    /// Bind with options the caller has already validated.
    pub(crate) fn bind<F: PipelineFilter>(
        self,
        chain: FilterChain<F>,
        options: ConnectionOptions,
    ) -> Channel<F> {
        let channel = Channel::assemble(self.reader, self.writer, chain, options);
        match self.remote_addr {
            Some(addr) => channel.with_remote_addr(addr),
            None => channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SockwireError;
    use crate::protocol::LineFilter;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_into_channel_validates_options() {
        let (local, _remote) = duplex(64);
        let options = ConnectionOptions {
            send_queue_capacity: 0,
            ..ConnectionOptions::default()
        };
        let result = Connection::from_stream(local).into_channel(FilterChain::new(LineFilter::new(), ()), options);
        assert!(matches!(result, Err(SockwireError::Config(_))));

        let (local, _remote) = duplex(64);
        let connection = Connection::from_stream(local);
        assert_eq!(connection.kind(), TransportKind::Stream);
        let channel = connection
            .into_channel(FilterChain::new(LineFilter::new(), ()), ConnectionOptions::default())
            .unwrap();
        assert_eq!(channel.remote_addr(), None);
    }
}
