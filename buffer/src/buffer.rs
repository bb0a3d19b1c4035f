//! Sample buffers bridging blocks and views to pipeline stages.
//!
//! Stages exchange samples through the [`SampleBuffer`] interface without
//! caring what memory sits underneath. Two implementations exist:
//!
//! - [`BlockBuffer`] wraps the write view of a block. A producer fills the
//!   window, marks the valid bytes with a [`Span`], and calls
//!   [`BlockBuffer::share`] to publish an immutable snapshot while keeping
//!   its write access for the next sample.
//! - [`FrozenBuffer`] wraps a read view over a [`FrozenBlock`]. Consumers
//!   may narrow the span but never write.
//!
//! Buffers are created exclusively through their `allocate` factories; a
//! buffer that exists is fully constructed and its capacity never changes.

use crate::{
    block::{Block, FrozenBlock, ReadView, WriteView},
    Error, Format,
};
use bytes::{buf::UninitSlice, Buf, BufMut};
use std::mem;

/// The active sub-window of a buffer: `len` valid bytes starting at `offset`.
///
/// A span never grants access outside the buffer's capacity; both buffer
/// variants validate on [`SampleBuffer::set_span`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Span {
    /// Offset of the first valid byte.
    pub offset: usize,
    /// Number of valid bytes.
    pub len: usize,
}

impl Span {
    /// Creates a span of `len` bytes starting at `offset`.
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// The span selecting no bytes.
    pub const fn empty() -> Self {
        Self { offset: 0, len: 0 }
    }

    /// Returns true if the span selects no bytes.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the offset one past the last valid byte.
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Returns true when `other` selects a subset of these bytes. An empty
    /// span is a subset of anything.
    pub const fn contains(&self, other: &Span) -> bool {
        other.is_empty() || (other.offset >= self.offset && other.end() <= self.end())
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Validates `span` against a window of `capacity` bytes.
fn check_span(span: Span, capacity: usize) -> Result<(), Error> {
    match span.offset.checked_add(span.len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::SpanOutOfBounds {
            offset: span.offset,
            len: span.len,
            capacity,
        }),
    }
}

/// Capability interface shared by every sample buffer.
///
/// The interface is object-safe: stages that handle both writable and frozen
/// samples can work through `&mut dyn SampleBuffer` or boxed buffers.
pub trait SampleBuffer {
    /// Returns the fixed window capacity in bytes.
    fn capacity(&self) -> usize;

    /// Returns the active span.
    fn span(&self) -> Span;

    /// Replaces the active span.
    ///
    /// # Errors
    ///
    /// - [`Error::SpanOutOfBounds`]: `span` exceeds the capacity
    /// - [`Error::SpanWiden`]: `span` grows a read-only buffer's span
    fn set_span(&mut self, span: Span) -> Result<(), Error>;

    /// Returns the format stored with the buffer.
    fn format(&self) -> &Format;

    /// Replaces the stored format. The descriptor is kept verbatim.
    fn set_format(&mut self, format: Format);

    /// Returns the full window.
    fn window(&self) -> &[u8];

    /// Returns the full window mutably.
    ///
    /// # Errors
    ///
    /// - [`Error::ReadOnly`]: the buffer cannot be written
    fn window_mut(&mut self) -> Result<&mut [u8], Error>;

    /// Returns the bytes under the active span.
    fn payload(&self) -> &[u8] {
        let span = self.span();
        &self.window()[span.offset..span.end()]
    }

    /// Returns the bytes under the active span mutably.
    ///
    /// # Errors
    ///
    /// - [`Error::ReadOnly`]: the buffer cannot be written
    fn payload_mut(&mut self) -> Result<&mut [u8], Error> {
        let span = self.span();
        Ok(&mut self.window_mut()?[span.offset..span.end()])
    }
}

/// Writable sample buffer backed by the write view of a block.
///
/// The window capacity is fixed at allocation. The active span starts empty
/// so an unfilled buffer never exposes stale payload; producers write through
/// [`SampleBuffer::window_mut`] (or the [`BufMut`] impl) and place the span
/// over the valid bytes.
pub struct BlockBuffer {
    view: WriteView,
    format: Format,
    span: Span,
}

impl std::fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBuffer")
            .field("capacity", &self.view.capacity())
            .field("span", &self.span)
            .finish()
    }
}

impl BlockBuffer {
    /// Claims `block`'s write view and wraps it as a writable sample buffer.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyBlock`]: the block has zero capacity
    /// - [`Error::ViewClaimed`]: another holder already claimed the view
    /// - [`Error::Frozen`]: the block was already finalized
    ///
    /// A refused block is left untouched: an outstanding view keeps working
    /// and an idle block remains claimable.
    pub fn allocate(format: Format, block: Block) -> Result<Self, Error> {
        if block.capacity() == 0 {
            return Err(Error::EmptyBlock);
        }
        let view = block.write_view()?;
        Ok(Self {
            view,
            format,
            span: Span::empty(),
        })
    }

    /// Publishes the bytes under the active span as an immutable snapshot
    /// and resets the span to empty for the next fill cycle.
    ///
    /// Sharing never costs a payload copy and never invalidates this buffer:
    /// writing and sharing interleave freely, and every snapshot stays
    /// frozen no matter what is written afterward. An unset (empty) span
    /// yields an empty snapshot.
    pub fn share(&mut self) -> FrozenBlock {
        let span = mem::take(&mut self.span);
        self.view.snapshot(span)
    }
}

impl SampleBuffer for BlockBuffer {
    fn capacity(&self) -> usize {
        self.view.capacity()
    }

    fn span(&self) -> Span {
        self.span
    }

    fn set_span(&mut self, span: Span) -> Result<(), Error> {
        check_span(span, self.view.capacity())?;
        self.span = span;
        Ok(())
    }

    fn format(&self) -> &Format {
        &self.format
    }

    fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    fn window(&self) -> &[u8] {
        self.view.as_slice()
    }

    fn window_mut(&mut self) -> Result<&mut [u8], Error> {
        Ok(self.view.as_mut_slice())
    }
}

impl Buf for BlockBuffer {
    #[inline]
    fn remaining(&self) -> usize {
        self.span.len
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        &self.view.as_slice()[self.span.offset..self.span.end()]
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.span.len, "cannot advance past end of span");
        self.span.offset += cnt;
        self.span.len -= cnt;
    }
}

// SAFETY: BufMut appends after the span's end within the fixed window.
// - `remaining_mut()` reports the writable tail (capacity - span end)
// - `chunk_mut()` exposes that tail (always initialized memory)
// - `advance_mut()` grows the span within bounds
//
// The window does NOT grow: writes beyond `remaining_mut()` panic, per the
// BufMut contract for fixed-capacity buffers.
unsafe impl BufMut for BlockBuffer {
    #[inline]
    fn remaining_mut(&self) -> usize {
        self.view.capacity() - self.span.end()
    }

    #[inline]
    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining_mut(),
            "cannot advance past end of window"
        );
        self.span.len += cnt;
    }

    #[inline]
    fn chunk_mut(&mut self) -> &mut UninitSlice {
        let end = self.span.end();
        UninitSlice::new(&mut self.view.as_mut_slice()[end..])
    }
}

/// Read-only sample buffer backed by a read view over a frozen block.
///
/// The window capacity is fixed to the frozen range and the span starts
/// covering all of it. The span may only shrink, and every write path is
/// refused without touching the bytes.
pub struct FrozenBuffer {
    view: ReadView,
    format: Format,
    span: Span,
}

impl std::fmt::Debug for FrozenBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenBuffer")
            .field("capacity", &self.view.len())
            .field("span", &self.span)
            .finish()
    }
}

impl FrozenBuffer {
    /// Wraps a frozen block as a read-only sample buffer.
    ///
    /// Cannot fail: a frozen block is always mappable, including the empty
    /// one (which yields a zero-capacity buffer).
    pub fn allocate(format: Format, block: FrozenBlock) -> Self {
        let view = block.read_view();
        let span = Span::new(0, view.len());
        Self { view, format, span }
    }
}

impl SampleBuffer for FrozenBuffer {
    fn capacity(&self) -> usize {
        self.view.len()
    }

    fn span(&self) -> Span {
        self.span
    }

    fn set_span(&mut self, span: Span) -> Result<(), Error> {
        check_span(span, self.view.len())?;
        if !self.span.contains(&span) {
            return Err(Error::SpanWiden(span, self.span));
        }
        self.span = span;
        Ok(())
    }

    fn format(&self) -> &Format {
        &self.format
    }

    fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    fn window(&self) -> &[u8] {
        self.view.as_slice()
    }

    fn window_mut(&mut self) -> Result<&mut [u8], Error> {
        Err(Error::ReadOnly)
    }
}

impl Buf for FrozenBuffer {
    #[inline]
    fn remaining(&self) -> usize {
        self.span.len
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        &self.view.as_slice()[self.span.offset..self.span.end()]
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.span.len, "cannot advance past end of span");
        self.span.offset += cnt;
        self.span.len -= cnt;
    }
}
