//! General-purpose filters: terminator-delimited, line and fixed-size packages.

use bytes::Bytes;

use super::{PipelineFilter, SequenceReader};
use crate::error::{Result, SockwireError};

/// Produces the bytes preceding each occurrence of a terminator.
///
/// The terminator is consumed and not included in the package. Bytes already
/// scanned without a match are not re-examined on the next call.
#[derive(Debug, Clone)]
pub struct TerminatorFilter {
    terminator: Bytes,
    scanned: usize,
}

impl TerminatorFilter {
    /// # Panics
    ///
    /// Panics if `terminator` is empty.
    pub fn new(terminator: impl Into<Bytes>) -> Self {
        let terminator = terminator.into();
        assert!(!terminator.is_empty(), "terminator must not be empty");
        Self {
            terminator,
            scanned: 0,
        }
    }

    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }

    /// Decode one package, usable from filters with any context type.
    pub fn decode(&mut self, reader: &mut SequenceReader<'_>) -> Option<Bytes> {
        match reader.position_of(&self.terminator, self.scanned) {
            Some(pos) => {
                let data = reader.read_bytes(pos)?;
                reader.advance(self.terminator.len());
                self.scanned = 0;
                Some(data)
            }
            None => {
                // A terminator may start in the last len-1 bytes.
                self.scanned = reader
                    .remaining()
                    .saturating_sub(self.terminator.len() - 1);
                None
            }
        }
    }
}

impl PipelineFilter for TerminatorFilter {
    type Package = Bytes;
    type Context = ();

    fn filter(&mut self, reader: &mut SequenceReader<'_>, _: &mut ()) -> Result<Option<Bytes>> {
        Ok(self.decode(reader))
    }

    fn reset(&mut self) {
        self.scanned = 0;
    }
}

/// `\r\n` terminated UTF-8 text lines.
#[derive(Debug, Clone)]
pub struct LineFilter {
    inner: TerminatorFilter,
}

impl LineFilter {
    pub fn new() -> Self {
        Self {
            inner: TerminatorFilter::new(Bytes::from_static(b"\r\n")),
        }
    }
}

impl Default for LineFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineFilter for LineFilter {
    type Package = String;
    type Context = ();

    fn filter(&mut self, reader: &mut SequenceReader<'_>, _: &mut ()) -> Result<Option<String>> {
        let Some(line) = self.inner.decode(reader) else {
            return Ok(None);
        };
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|e| SockwireError::protocol(format!("line is not valid UTF-8: {e}")))
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Packages of exactly `size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeFilter {
    size: usize,
}

impl FixedSizeFilter {
    /// # Panics
    ///
    /// Panics if `size` is 0.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "fixed package size must be positive");
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn decode(&mut self, reader: &mut SequenceReader<'_>) -> Option<Bytes> {
        reader.read_bytes(self.size)
    }
}

impl PipelineFilter for FixedSizeFilter {
    type Package = Bytes;
    type Context = ();

    fn filter(&mut self, reader: &mut SequenceReader<'_>, _: &mut ()) -> Result<Option<Bytes>> {
        Ok(self.decode(reader))
    }

    fn reset(&mut self) {}
}
