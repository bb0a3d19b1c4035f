//! Pass samples between pipeline stages without copying payload bytes.
//!
//! # Overview
//!
//! Media pipelines move large frames through many stages. This crate keeps
//! each payload in place:
//! - [`BlockPool`] recycles aligned, size-classed storage so steady-state
//!   streaming stops hitting the allocator
//! - [`Block`] is a claimable handle to one piece of storage
//! - [`BlockBuffer`] gives a producer exclusive write access to a block and
//!   publishes immutable snapshots through [`BlockBuffer::share`]
//! - [`FrozenBuffer`] lets any number of consumers read a snapshot, narrowing
//!   their [`Span`] as parsing proceeds
//!
//! Stages that do not care which variant they hold work through the
//! object-safe [`SampleBuffer`] trait.
//!
//! # Example
//!
//! ```
//! use medialane_buffer::{
//!     BlockBuffer, BlockPool, Format, FrozenBuffer, PoolConfig, SampleBuffer, Span,
//! };
//! use prometheus_client::registry::Registry;
//!
//! // Set up a pool sized for compressed frames
//! let mut registry = Registry::default();
//! let pool = BlockPool::new(PoolConfig::for_compressed(), &mut registry);
//!
//! // Fill a block through a writable sample buffer
//! let mut producer = BlockBuffer::allocate(Format::new("video/avc"), pool.alloc(4096)).unwrap();
//! producer.window_mut().unwrap()[..5].copy_from_slice(b"frame");
//! producer.set_span(Span::new(0, 5)).unwrap();
//!
//! // Publish a snapshot without copying the payload; the producer keeps its
//! // write access for the next sample
//! let snapshot = producer.share();
//! let consumer = FrozenBuffer::allocate(producer.format().clone(), snapshot);
//! assert_eq!(consumer.payload(), b"frame");
//! assert_eq!(producer.span(), Span::empty());
//! ```

pub mod block;
pub mod buffer;
pub mod error;
pub mod format;

// Re-export main types and traits
pub use block::{Block, BlockPool, FrozenBlock, PoolConfig, ReadView, WriteView};
pub use buffer::{BlockBuffer, FrozenBuffer, SampleBuffer, Span};
pub use error::Error;
pub use format::Format;
