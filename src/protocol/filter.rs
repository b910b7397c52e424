//! The pipeline filter contract.
//!
//! A filter turns the unconsumed received bytes into zero or one package per
//! call. It reads through a [`SequenceReader`]; the number of bytes the
//! reader has moved past when the call returns is what gets consumed.
//!
//! | Return                       | Reader moved | Meaning                               |
//! |------------------------------|--------------|---------------------------------------|
//! | `Ok(Some(package))`          | any          | Package complete, filter is reset     |
//! | `Ok(None)`                   | > 0          | Progress made, call again immediately |
//! | `Ok(None)`                   | 0            | Need more data                        |
//! | `Err(_)`                     | -            | Unrecoverable, channel closes         |
//!
//! After every call the chain asks [`PipelineFilter::next_filter`]. A `Some`
//! value permanently replaces the active filter and the new one runs against
//! the same unconsumed bytes without waiting for I/O.

use bytes::{Bytes, BytesMut};

use super::SequenceReader;
use crate::error::Result;

/// State shared by every filter of one channel's chain.
///
/// Owned by the chain, passed to each filter call by `&mut` and kept across
/// filter switches.
pub trait FilterContext: Send + 'static {
    /// Bytes the chain must write back to the peer before any package
    /// produced by the same call is delivered (handshake replies).
    fn take_reply(&mut self) -> Option<Bytes> {
        None
    }

    /// Called once with the owning buffer's package limit (0 = unlimited),
    /// for contexts that assemble one package from several filter calls.
    fn set_max_package_length(&mut self, _max: usize) {}
}

impl FilterContext for () {}

/// An incremental parser unit.
pub trait PipelineFilter: Send + 'static {
    /// Decoded unit handed to the consumer.
    type Package: Send + 'static;

    /// Per-channel state kept across filter switches.
    type Context: FilterContext;

    /// Try to decode one package from the bytes visible through `reader`.
    fn filter(
        &mut self,
        reader: &mut SequenceReader<'_>,
        context: &mut Self::Context,
    ) -> Result<Option<Self::Package>>;

    /// The filter to switch to, if this one has finished its phase.
    ///
    /// Returns `Some` at most once; the chain swaps immediately.
    fn next_filter(&mut self) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }

    /// Clear filter-local parsing state after a package was produced.
    fn reset(&mut self);

    /// True while the filter only discards input. Discarded bytes do not
    /// count toward the package length limit.
    fn is_discarding(&self) -> bool {
        false
    }
}

/// Serializes a package into outbound bytes.
pub trait PackageEncoder<P: ?Sized> {
    /// Append the encoded form of `package` to `dst`, returning the number
    /// of bytes written.
    fn encode(&mut self, dst: &mut BytesMut, package: &P) -> Result<usize>;
}

/// Writes raw bytes through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawEncoder;

impl PackageEncoder<[u8]> for RawEncoder {
    fn encode(&mut self, dst: &mut BytesMut, package: &[u8]) -> Result<usize> {
        dst.extend_from_slice(package);
        Ok(package.len())
    }
}

/// Encodes text lines followed by a fixed terminator.
#[derive(Debug, Clone)]
pub struct LineEncoder {
    terminator: Bytes,
}

impl LineEncoder {
    pub fn new(terminator: impl Into<Bytes>) -> Self {
        Self {
            terminator: terminator.into(),
        }
    }
}

impl Default for LineEncoder {
    fn default() -> Self {
        Self::new(Bytes::from_static(b"\r\n"))
    }
}

impl PackageEncoder<str> for LineEncoder {
    fn encode(&mut self, dst: &mut BytesMut, package: &str) -> Result<usize> {
        dst.reserve(package.len() + self.terminator.len());
        dst.extend_from_slice(package.as_bytes());
        dst.extend_from_slice(&self.terminator);
        Ok(package.len() + self.terminator.len())
    }
}
