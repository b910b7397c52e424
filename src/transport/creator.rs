use std::sync::Arc;

use super::Connection;
use crate::channel::Channel;
use crate::error::Result;
use crate::options::ConnectionOptions;
use crate::protocol::{FilterChain, PipelineFilter};

/// Builds a fresh filter chain head (and its context) for each connection.
pub type FilterFactory<F> = Arc<dyn Fn() -> FilterChain<F> + Send + Sync>;

/// Turns accepted connections into channels.
///
/// Holds the immutable [`ConnectionOptions`] every channel gets and the
/// factory producing each channel's own filter chain.
pub struct ChannelCreator<F: PipelineFilter> {
    options: ConnectionOptions,
    factory: FilterFactory<F>,
}

impl<F: PipelineFilter> Clone for ChannelCreator<F> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<F: PipelineFilter> ChannelCreator<F> {
    /// Validate `options` and capture them with `factory`.
    pub fn new<G>(options: ConnectionOptions, factory: G) -> Result<Self>
    where
        G: Fn() -> FilterChain<F> + Send + Sync + 'static,
    {
        options.validate()?;
        Ok(Self {
            options,
            factory: Arc::new(factory),
        })
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Create an unstarted channel for `connection`.
    pub fn create(&self, connection: Connection) -> Channel<F> {
        let chain = (self.factory)();
        let channel = connection.bind(chain, self.options.clone());
        tracing::debug!(
            channel_id = channel.id(),
            remote = ?channel.remote_addr(),
            "channel created"
        );
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SockwireError;
    use crate::protocol::LineFilter;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_invalid_options_rejected() {
        let options = ConnectionOptions {
            send_queue_capacity: 0,
            ..ConnectionOptions::default()
        };
        let result = ChannelCreator::new(options, || FilterChain::new(LineFilter::new(), ()));
        assert!(matches!(result, Err(SockwireError::Config(_))));
    }

    #[tokio::test]
    async fn test_each_channel_gets_its_own_chain() {
        let creator =
            ChannelCreator::new(ConnectionOptions::default(), || {
                FilterChain::new(LineFilter::new(), ())
            })
            .unwrap();

        let (a_local, mut a_remote) = duplex(1024);
        let (b_local, mut b_remote) = duplex(1024);
        let a = creator.create(Connection::from_stream(a_local));
        let b = creator.create(Connection::from_stream(b_local));
        assert_ne!(a.id(), b.id());

        let mut a_packages = a.run().unwrap();
        let mut b_packages = b.run().unwrap();

        a_remote.write_all(b"par").await.unwrap();
        b_remote.write_all(b"other\r\n").await.unwrap();
        a_remote.write_all(b"tial\r\n").await.unwrap();

        assert_eq!(b_packages.next().await.unwrap(), "other");
        assert_eq!(a_packages.next().await.unwrap(), "partial");
    }
}
