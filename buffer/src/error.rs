//! Error types for buffer operations

use thiserror::Error;

/// Error type for buffer operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("block has zero capacity")]
    EmptyBlock,
    #[error("write view already claimed")]
    ViewClaimed,
    #[error("block already frozen")]
    Frozen,
    #[error("buffer is read-only")]
    ReadOnly,
    #[error("span can only shrink: {0} not contained in {1}")]
    SpanWiden(crate::buffer::Span, crate::buffer::Span),
    #[error("span out of bounds: offset {offset} + len {len} > capacity {capacity}")]
    SpanOutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("requested capacity {requested} exceeds maximum block size {max}")]
    Oversized { requested: usize, max: usize },
    #[error("pool exhausted for {capacity}-byte size class")]
    Exhausted { capacity: usize },
}
