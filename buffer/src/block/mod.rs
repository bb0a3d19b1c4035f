//! Pooled memory blocks and the views that expose them.
//!
//! A [`Block`] is a handle to aligned, zero-initialized storage of fixed
//! capacity, usually leased from a [`BlockPool`]. Claiming a block's
//! [`WriteView`] grants the one and only mutable window over that storage.
//! Finalized bytes travel as [`FrozenBlock`] snapshots: reference-counted,
//! immutable, and sliceable without copying. A [`ReadView`] is the bounded
//! read-only window a consumer holds over a frozen block.
//!
//! Storage flows back to its originating pool when the last holder (block
//! handle, write view, or frozen snapshot) lets go. Untracked storage (from
//! [`Block::with_capacity`] or pool fallback) is deallocated directly.

mod handle;
mod pool;

pub use handle::{Block, FrozenBlock, ReadView, WriteView};
pub use pool::{BlockPool, PoolConfig};
