//! Accumulating byte sequence and the cursor filters read it through.
//!
//! Received bytes are kept as a list of frozen `bytes::Bytes` segments, one
//! per transport read. Nothing is copied when data arrives, and a package
//! that lies inside a single segment is handed out as a zero-copy slice.
//! Only packages that straddle a read boundary are copied into one
//! contiguous buffer.
//!
//! ```text
//! ByteSequence:  [ seg 0 ][ seg 1 ........ ][ seg 2 ]
//! Reader:              ^ consumed
//!                      |---- remaining --------------|
//! ```
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use sockwire::protocol::ByteSequence;
//!
//! let mut seq = ByteSequence::new();
//! seq.push(Bytes::from_static(b"hel"));
//! seq.push(Bytes::from_static(b"lo\r\n"));
//!
//! let mut reader = seq.reader();
//! let pos = reader.position_of(b"\r\n", 0).unwrap();
//! assert_eq!(&reader.read_bytes(pos).unwrap()[..], b"hello");
//! ```

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Result, SockwireError};

/// Ordered, append-only collection of unconsumed received bytes.
///
/// The consumed prefix is dropped by [`advance`](Self::advance) and never
/// read again; the unconsumed suffix is kept verbatim across receive calls.
#[derive(Debug, Default, Clone)]
pub struct ByteSequence {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl ByteSequence {
    /// Create an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received segment (zero-copy).
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    /// Append a copy of `data`.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    /// Number of unconsumed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of segments currently held.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Drop the first `count` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `count` is larger than [`len`](Self::len).
    pub fn advance(&mut self, mut count: usize) {
        assert!(count <= self.len, "advance past end of sequence");
        self.len -= count;

        while count > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= count {
                count -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(count);
                count = 0;
            }
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }

    /// Get `len` bytes starting at `start`.
    ///
    /// Zero-copy when the range lies in one segment. Returns `None` if the
    /// range runs past the end.
    pub fn slice(&self, start: usize, len: usize) -> Option<Bytes> {
        let mut reader = self.reader();
        if start > reader.remaining() {
            return None;
        }
        reader.advance(start);
        reader.read_bytes(len)
    }

    /// Decode `len` bytes starting at `start` as UTF-8.
    pub fn decode_utf8(&self, start: usize, len: usize) -> Result<String> {
        let bytes = self
            .slice(start, len)
            .ok_or_else(|| SockwireError::protocol("range exceeds buffered data"))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SockwireError::protocol(format!("invalid UTF-8: {e}")))
    }

    /// A cursor positioned at the first unconsumed byte.
    pub fn reader(&self) -> SequenceReader<'_> {
        SequenceReader {
            seq: self,
            consumed: 0,
            segment: 0,
            offset: 0,
        }
    }
}

/// Cursor over a [`ByteSequence`].
///
/// Reading moves the cursor forward; `rewind` moves it back. The number of
/// bytes the cursor has moved past is [`consumed`](Self::consumed), which the
/// pipeline uses to decide how much of the sequence to drop.
#[derive(Debug, Clone)]
pub struct SequenceReader<'a> {
    seq: &'a ByteSequence,
    consumed: usize,
    segment: usize,
    offset: usize,
}

impl<'a> SequenceReader<'a> {
    /// Total bytes visible to this reader.
    #[inline]
    pub fn length(&self) -> usize {
        self.seq.len
    }

    /// Bytes read so far.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes left after the cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.seq.len - self.consumed
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.remaining() == 0
    }

    /// The contiguous bytes at the cursor, if any.
    fn current(&self) -> Option<&'a [u8]> {
        let mut segment = self.segment;
        let mut offset = self.offset;
        while let Some(seg) = self.seq.segments.get(segment) {
            if offset < seg.len() {
                return Some(&seg[offset..]);
            }
            segment += 1;
            offset = 0;
        }
        None
    }

    /// Move the cursor forward by `count` bytes.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `count` bytes remain.
    pub fn advance(&mut self, mut count: usize) {
        assert!(count <= self.remaining(), "advance past end of reader");
        self.consumed += count;

        while count > 0 {
            let seg_len = self.seq.segments[self.segment].len();
            let available = seg_len - self.offset;
            if count < available {
                self.offset += count;
                count = 0;
            } else {
                count -= available;
                self.segment += 1;
                self.offset = 0;
            }
        }
    }

    /// Move the cursor back by `count` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `count` is larger than [`consumed`](Self::consumed).
    pub fn rewind(&mut self, count: usize) {
        assert!(count <= self.consumed, "rewind before start of reader");
        let target = self.consumed - count;
        self.consumed = 0;
        self.segment = 0;
        self.offset = 0;
        self.advance(target);
    }

    /// Next byte without moving the cursor.
    pub fn peek(&self) -> Option<u8> {
        self.current().map(|bytes| bytes[0])
    }

    /// Copy `dst.len()` bytes at the cursor into `dst` without moving.
    ///
    /// Returns false (and leaves `dst` unspecified) if not enough bytes remain.
    pub fn peek_into(&self, dst: &mut [u8]) -> bool {
        if dst.len() > self.remaining() {
            return false;
        }
        let mut written = 0;
        let mut segment = self.segment;
        let mut offset = self.offset;
        while written < dst.len() {
            let seg = &self.seq.segments[segment];
            let take = (seg.len() - offset).min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&seg[offset..offset + take]);
            written += take;
            segment += 1;
            offset = 0;
        }
        true
    }

    pub fn try_read_u8(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.advance(1);
        Some(byte)
    }

    /// Read a big-endian `u16`.
    pub fn try_read_u16_be(&mut self) -> Option<u16> {
        let mut buf = [0u8; 2];
        if !self.peek_into(&mut buf) {
            return None;
        }
        self.advance(2);
        Some(u16::from_be_bytes(buf))
    }

    /// Read a big-endian `u64`.
    pub fn try_read_u64_be(&mut self) -> Option<u64> {
        let mut buf = [0u8; 8];
        if !self.peek_into(&mut buf) {
            return None;
        }
        self.advance(8);
        Some(u64::from_be_bytes(buf))
    }

    /// Read `len` bytes.
    ///
    /// Zero-copy when the bytes lie in one segment, otherwise copied into a
    /// single buffer. Returns `None` without moving if not enough bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Option<Bytes> {
        if len > self.remaining() {
            return None;
        }
        if len == 0 {
            return Some(Bytes::new());
        }

        if let Some(current) = self.current() {
            if current.len() >= len {
                // Locate the segment that `current` came from to slice it.
                let mut segment = self.segment;
                let mut offset = self.offset;
                while self.seq.segments[segment].len() <= offset {
                    segment += 1;
                    offset = 0;
                }
                let bytes = self.seq.segments[segment].slice(offset..offset + len);
                self.advance(len);
                return Some(bytes);
            }
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        self.peek_into(&mut buf);
        self.advance(len);
        Some(buf.freeze())
    }

    /// Offset (relative to the cursor) where `delimiter` starts, searching
    /// from relative offset `from`. The cursor does not move.
    pub fn position_of(&self, delimiter: &[u8], from: usize) -> Option<usize> {
        if delimiter.is_empty() || from >= self.remaining() {
            return None;
        }

        let mut window: VecDeque<u8> = VecDeque::with_capacity(delimiter.len());
        let mut index = from;
        for byte in self.bytes().skip(from) {
            if window.len() == delimiter.len() {
                window.pop_front();
            }
            window.push_back(byte);
            index += 1;

            if window.len() == delimiter.len() && window.iter().eq(delimiter.iter()) {
                return Some(index - delimiter.len());
            }
        }
        None
    }

    /// Iterate the remaining bytes without moving the cursor.
    pub fn bytes(&self) -> impl Iterator<Item = u8> + 'a {
        let offset = self.offset;
        self.seq
            .segments
            .iter()
            .skip(self.segment)
            .enumerate()
            .flat_map(move |(i, seg)| {
                let start = if i == 0 { offset.min(seg.len()) } else { 0 };
                seg[start..].iter().copied()
            })
    }
}
