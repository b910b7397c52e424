//! Filter chain and reassembly buffer.
//!
//! [`PipelineBuffer`] accumulates received segments and runs the active
//! filter over them until it needs more data:
//!
//! - package produced: reset the filter and keep parsing the rest
//! - filter switch: make the next filter active and re-run on the same bytes
//! - bytes consumed but no package: call the filter again (multi-stage filters)
//! - nothing consumed: wait for more data
//!
//! The buffer is synchronous so it can be driven directly in tests; the
//! channel's fill loop owns one per connection.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use sockwire::protocol::{LineFilter, PipelineBuffer};
//!
//! let mut buffer = PipelineBuffer::new(LineFilter::new(), (), 0);
//! assert!(buffer.push(Bytes::from_static(b"hel")).unwrap().is_empty());
//! let lines = buffer.push(Bytes::from_static(b"lo\r\nworld\r\n")).unwrap();
//! assert_eq!(lines, vec!["hello", "world"]);
//! ```

use bytes::Bytes;
use tracing::trace;

use super::{ByteSequence, FilterContext, PipelineFilter};
use crate::error::{Result, SockwireError};

/// One item produced while decoding.
#[derive(Debug)]
pub enum Decoded<P> {
    /// Bytes that must be sent back to the peer (handshake replies).
    Reply(Bytes),
    /// A complete package.
    Package(P),
}

/// The active filter of a channel plus the context every filter shares.
pub struct FilterChain<F: PipelineFilter> {
    active: F,
    context: F::Context,
    switches: usize,
}

impl<F: PipelineFilter> FilterChain<F> {
    pub fn new(head: F, context: F::Context) -> Self {
        Self {
            active: head,
            context,
            switches: 0,
        }
    }

    #[inline]
    pub fn active(&self) -> &F {
        &self.active
    }

    #[inline]
    pub fn context(&self) -> &F::Context {
        &self.context
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut F::Context {
        &mut self.context
    }

    /// Number of filter switches performed so far.
    #[inline]
    pub fn switches(&self) -> usize {
        self.switches
    }

    /// Swap in the next filter if the active one asks for it.
    fn try_switch(&mut self) -> bool {
        match self.active.next_filter() {
            Some(next) => {
                self.active = next;
                self.switches += 1;
                true
            }
            None => false,
        }
    }
}

/// Accumulates received bytes and extracts packages through a filter chain.
pub struct PipelineBuffer<F: PipelineFilter> {
    sequence: ByteSequence,
    chain: FilterChain<F>,
    max_package_length: usize,
    replies: Vec<Bytes>,
}

impl<F: PipelineFilter> PipelineBuffer<F> {
    /// Create a buffer with `head` as the first active filter.
    ///
    /// `max_package_length` of 0 disables the size check.
    pub fn new(head: F, context: F::Context, max_package_length: usize) -> Self {
        Self::from_chain(FilterChain::new(head, context), max_package_length)
    }

    pub fn from_chain(mut chain: FilterChain<F>, max_package_length: usize) -> Self {
        chain.context.set_max_package_length(max_package_length);
        Self {
            sequence: ByteSequence::new(),
            chain,
            max_package_length,
            replies: Vec::new(),
        }
    }

    /// Append a received segment without decoding.
    pub fn extend(&mut self, segment: Bytes) {
        self.sequence.push(segment);
    }

    /// Append a segment and return every package it completes.
    ///
    /// Replies produced along the way are kept for [`take_replies`](Self::take_replies).
    pub fn push(&mut self, segment: Bytes) -> Result<Vec<F::Package>> {
        self.sequence.push(segment);

        let mut decoded = Vec::new();
        let result = self.decode_into(&mut decoded);

        let mut packages = Vec::with_capacity(decoded.len());
        for item in decoded {
            match item {
                Decoded::Reply(bytes) => self.replies.push(bytes),
                Decoded::Package(package) => packages.push(package),
            }
        }
        result.map(|_| packages)
    }

    /// Replies collected by [`push`](Self::push).
    pub fn take_replies(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.replies)
    }

    /// Run the filter chain over the buffered bytes.
    ///
    /// Items are appended to `out` in order. On error, items decoded before
    /// the failure are still in `out`; the failing package is not.
    pub fn decode_into(&mut self, out: &mut Vec<Decoded<F::Package>>) -> Result<()> {
        loop {
            let mut reader = self.sequence.reader();
            let result = self
                .chain
                .active
                .filter(&mut reader, &mut self.chain.context);
            let consumed = reader.consumed();
            let buffered = reader.length();

            while let Some(reply) = self.chain.context.take_reply() {
                out.push(Decoded::Reply(reply));
            }

            let package = result?;

            let measured = if consumed > 0 { consumed } else { buffered };
            if self.max_package_length > 0
                && measured > self.max_package_length
                && !self.chain.active.is_discarding()
            {
                return Err(SockwireError::protocol(format!(
                    "package of {} bytes exceeds maximum {}",
                    measured, self.max_package_length
                )));
            }

            self.sequence.advance(consumed);
            let switched = self.chain.try_switch();
            if switched {
                trace!(switches = self.chain.switches, "filter switched");
            }

            match package {
                Some(package) => {
                    if !switched {
                        self.chain.active.reset();
                    }
                    out.push(Decoded::Package(package));
                }
                None if !switched && consumed == 0 => return Ok(()),
                None => {}
            }
        }
    }

    /// Number of unconsumed buffered bytes.
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn chain(&self) -> &FilterChain<F> {
        &self.chain
    }

    pub fn context(&self) -> &F::Context {
        &self.chain.context
    }

    pub fn context_mut(&mut self) -> &mut F::Context {
        &mut self.chain.context
    }

    #[inline]
    pub fn max_package_length(&self) -> usize {
        self.max_package_length
    }
}
