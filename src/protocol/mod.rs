//! Protocol module - byte sequences, the pipeline filter contract and the
//! reassembly buffer.
//!
//! - [`ByteSequence`] / [`SequenceReader`]: segmented receive buffer and cursor
//! - [`PipelineFilter`] / [`FilterContext`]: the seam every protocol implements
//! - [`PipelineBuffer`]: runs the active filter over buffered bytes
//! - general-purpose filters and encoders

mod filter;
mod pipeline;
mod sequence;
mod terminator;

pub use filter::{FilterContext, LineEncoder, PackageEncoder, PipelineFilter, RawEncoder};
pub use pipeline::{Decoded, FilterChain, PipelineBuffer};
pub use sequence::{ByteSequence, SequenceReader};
pub use terminator::{FixedSizeFilter, LineFilter, TerminatorFilter};
