//! Block pool with power-of-two size classes.
//!
//! Media pipelines allocate and release sample storage at frame rate, so
//! blocks are recycled through lock-free freelists instead of hitting the
//! global allocator on every sample. Alignment is configurable: encoded
//! bitstream blocks get by with cache-line alignment, while raw frame blocks
//! are page-aligned for zero-copy handoff to mapped device memory.
//!
//! # Thread Safety
//!
//! [`BlockPool`] is `Send + Sync` and cheap to clone. Allocation and release
//! are lock-free ([`crossbeam_queue::ArrayQueue`] plus atomic counters).
//!
//! # Pool Lifecycle
//!
//! Blocks hold a weak reference to the pool. Storage released after the pool
//! is gone is deallocated directly, so the pool may be dropped while blocks
//! and snapshots are still circulating.
//!
//! # Size Classes
//!
//! Capacities are organized into power-of-two classes from `min_size` to
//! `max_size`; a request is served by the smallest class that fits. Requests
//! above `max_size` fail [`BlockPool::try_alloc`] and fall back to an
//! untracked allocation in [`BlockPool::alloc`].

use super::handle::Block;
use crate::Error;
use crossbeam_queue::ArrayQueue;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    num::NonZeroUsize,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use tracing::debug;

macro_rules! nonzero {
    ($value:expr) => {
        match NonZeroUsize::new($value) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}

/// Returns the system page size.
///
/// Queries `sysconf` on Unix and assumes 4KB elsewhere.
#[cfg(unix)]
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096 // Safe fallback if sysconf fails
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
#[allow(clippy::missing_const_for_fn)]
pub(crate) fn page_size() -> usize {
    4096
}

/// Returns the cache line size for the current architecture.
///
/// Uses 128 bytes for x86_64 and aarch64 to account for spatial prefetching,
/// 64 bytes elsewhere.
pub(crate) const fn cache_line_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            128
        } else {
            64
        }
    }
}

/// Configuration for a block pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum block size. Must be >= alignment and a power of two.
    pub min_size: NonZeroUsize,
    /// Maximum block size. Must be a power of two and >= min_size.
    pub max_size: NonZeroUsize,
    /// Maximum number of blocks per size class.
    pub max_per_class: NonZeroUsize,
    /// Whether to pre-allocate all storage on pool creation.
    pub prefill: bool,
    /// Storage alignment. Must be a power of two.
    pub alignment: NonZeroUsize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_compressed()
    }
}

impl PoolConfig {
    /// Compressed-sample preset: cache-line aligned, 4KB to 1MB blocks,
    /// 256 per class, not prefilled.
    ///
    /// Encoded access units are small and bursty (several in flight per
    /// stream between demux, decode, and render), so classes are deep.
    /// Cache-line alignment keeps internal fragmentation low; bitstream
    /// blocks never need page alignment.
    pub const fn for_compressed() -> Self {
        Self {
            min_size: nonzero!(4096),
            max_size: nonzero!(1024 * 1024),
            max_per_class: nonzero!(256),
            prefill: false,
            alignment: nonzero!(cache_line_size()),
        }
    }

    /// Raw-frame preset: page-aligned, page_size to 16MB blocks, 8 per class,
    /// not prefilled.
    ///
    /// Page alignment is required when frame storage is handed to mapped
    /// device memory. Uncompressed frames are large and few are in flight,
    /// so classes are shallow.
    pub fn for_raw() -> Self {
        let page = nonzero!(page_size());
        Self {
            min_size: page,
            max_size: nonzero!(16 * 1024 * 1024),
            max_per_class: nonzero!(8),
            prefill: false,
            alignment: page,
        }
    }

    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `alignment` is not a power of two
    /// - `min_size` is not a power of two
    /// - `max_size` is not a power of two
    /// - `min_size < alignment`
    /// - `max_size < min_size`
    fn validate(&self) {
        assert!(
            self.alignment.is_power_of_two(),
            "alignment must be a power of two"
        );
        assert!(
            self.min_size.is_power_of_two(),
            "min_size must be a power of two"
        );
        assert!(
            self.max_size.is_power_of_two(),
            "max_size must be a power of two"
        );
        assert!(
            self.min_size >= self.alignment,
            "min_size ({}) must be >= alignment ({})",
            self.min_size,
            self.alignment
        );
        assert!(
            self.max_size >= self.min_size,
            "max_size must be >= min_size"
        );
    }

    /// Returns the number of size classes.
    fn num_classes(&self) -> usize {
        if self.max_size < self.min_size {
            return 0;
        }
        // Classes are: min_size, min_size*2, min_size*4, ..., max_size
        (self.max_size.get() / self.min_size.get()).trailing_zeros() as usize + 1
    }

    /// Returns the size class index for a given capacity.
    /// Returns None if capacity > max_size.
    fn class_index(&self, capacity: usize) -> Option<usize> {
        if capacity > self.max_size.get() {
            return None;
        }
        if capacity <= self.min_size.get() {
            return Some(0);
        }
        // Find the smallest power-of-two class that fits
        let size_class = capacity.next_power_of_two();
        let index = (size_class / self.min_size.get()).trailing_zeros() as usize;
        if index < self.num_classes() {
            Some(index)
        } else {
            None
        }
    }

    /// Returns the block size for a given class index.
    const fn class_size(&self, index: usize) -> usize {
        self.min_size.get() << index
    }
}

/// Label for block pool metrics, identifying the size class.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SizeClassLabel {
    size_class: u64,
}

/// Metrics for the block pool.
struct PoolMetrics {
    /// Number of blocks currently allocated (out of pool).
    allocated: Family<SizeClassLabel, Gauge>,
    /// Number of blocks available in the pool.
    available: Family<SizeClassLabel, Gauge>,
    /// Total number of successful allocations.
    allocations_total: Family<SizeClassLabel, Counter>,
    /// Total number of failed allocations (pool exhausted).
    exhausted_total: Family<SizeClassLabel, Counter>,
    /// Total number of oversized allocation requests.
    oversized_total: Counter,
}

impl PoolMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Family::default(),
            available: Family::default(),
            allocations_total: Family::default(),
            exhausted_total: Family::default(),
            oversized_total: Counter::default(),
        };

        registry.register(
            "block_pool_allocated",
            "Number of blocks currently allocated from the pool",
            metrics.allocated.clone(),
        );
        registry.register(
            "block_pool_available",
            "Number of blocks available in the pool",
            metrics.available.clone(),
        );
        registry.register(
            "block_pool_allocations_total",
            "Total number of successful block allocations",
            metrics.allocations_total.clone(),
        );
        registry.register(
            "block_pool_exhausted_total",
            "Total number of failed allocations due to pool exhaustion",
            metrics.exhausted_total.clone(),
        );
        registry.register(
            "block_pool_oversized_total",
            "Total number of allocation requests exceeding max block size",
            metrics.oversized_total.clone(),
        );

        metrics
    }
}

/// Aligned, zero-initialized block storage.
///
/// Every byte of a fresh allocation is zeroed, so the full capacity may be
/// exposed as initialized memory from the start. Deallocates itself on drop
/// using the stored layout. Zero-capacity storage holds a dangling pointer
/// and never touches the allocator.
pub(crate) struct AlignedStorage {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedStorage owns its memory and can be sent between threads.
unsafe impl Send for AlignedStorage {}
// SAFETY: AlignedStorage's memory is not shared (no interior mutability of pointer).
unsafe impl Sync for AlignedStorage {}

impl AlignedStorage {
    /// Allocates zeroed storage with the given capacity and alignment.
    ///
    /// # Panics
    ///
    /// Panics if allocation fails or alignment is not a power of two.
    pub(crate) fn zeroed(capacity: usize, alignment: usize) -> Self {
        let layout = Layout::from_size_align(capacity, alignment).expect("invalid storage layout");
        if layout.size() == 0 {
            // Zero-sized layouts must not reach the allocator.
            return Self {
                ptr: NonNull::dangling(),
                layout,
            };
        }

        // SAFETY: layout is valid (non-zero size, power-of-two alignment).
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("allocation failed");

        Self { ptr, layout }
    }

    /// Returns the capacity of the storage.
    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the alignment of the storage.
    #[inline]
    pub(crate) const fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Returns a raw pointer to the storage.
    #[inline]
    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedStorage {
    fn drop(&mut self) {
        if self.layout.size() == 0 {
            return;
        }
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Per-size-class state.
///
/// The freelist stores `Option<AlignedStorage>` where:
/// - `Some(storage)` = reusable storage
/// - `None` = an available slot for creating new storage
struct SizeClass {
    /// The block size for this class.
    size: usize,
    /// Storage alignment.
    alignment: usize,
    /// Free list storing either reusable storage or empty slots.
    freelist: ArrayQueue<Option<AlignedStorage>>,
    /// Number of blocks currently allocated (out of pool).
    allocated: AtomicUsize,
}

impl SizeClass {
    fn new(size: usize, alignment: usize, max_blocks: usize, prefill: bool) -> Self {
        let freelist = ArrayQueue::new(max_blocks);
        for _ in 0..max_blocks {
            let entry = if prefill {
                Some(AlignedStorage::zeroed(size, alignment))
            } else {
                None
            };
            let _ = freelist.push(entry);
        }
        Self {
            size,
            alignment,
            freelist,
            allocated: AtomicUsize::new(0),
        }
    }
}

/// Internal state of the block pool.
pub(crate) struct PoolInner {
    config: PoolConfig,
    classes: Vec<SizeClass>,
    metrics: PoolMetrics,
}

impl PoolInner {
    /// Try to take storage out of the given size class.
    fn try_take(&self, class_index: usize) -> Option<AlignedStorage> {
        let class = &self.classes[class_index];
        let label = SizeClassLabel {
            size_class: class.size as u64,
        };

        match class.freelist.pop() {
            Some(Some(storage)) => {
                // Reuse existing storage
                class.allocated.fetch_add(1, Ordering::Relaxed);
                self.metrics.allocations_total.get_or_create(&label).inc();
                self.metrics.allocated.get_or_create(&label).inc();
                self.metrics.available.get_or_create(&label).dec();
                Some(storage)
            }
            Some(None) => {
                // Create new storage (we have a slot)
                class.allocated.fetch_add(1, Ordering::Relaxed);
                self.metrics.allocations_total.get_or_create(&label).inc();
                self.metrics.allocated.get_or_create(&label).inc();
                Some(AlignedStorage::zeroed(class.size, class.alignment))
            }
            None => {
                // Class exhausted (no slots available)
                self.metrics.exhausted_total.get_or_create(&label).inc();
                None
            }
        }
    }

    /// Take storage whose capacity is exactly `capacity`.
    ///
    /// Used to re-arm a write view after its storage was handed to a
    /// snapshot. Returns None when the capacity is not an exact class size
    /// or the class is exhausted; the caller falls back to an untracked
    /// allocation.
    pub(crate) fn take_exact(&self, capacity: usize) -> Option<AlignedStorage> {
        let class_index = self.config.class_index(capacity)?;
        if self.config.class_size(class_index) != capacity {
            return None;
        }
        self.try_take(class_index)
    }

    /// Return storage to the pool.
    pub(crate) fn return_storage(&self, storage: AlignedStorage) {
        // Find the class for this capacity
        if let Some(class_index) = self.config.class_index(storage.capacity()) {
            let class = &self.classes[class_index];
            let label = SizeClassLabel {
                size_class: class.size as u64,
            };

            class.allocated.fetch_sub(1, Ordering::Relaxed);
            self.metrics.allocated.get_or_create(&label).dec();

            // Try to return to freelist
            match class.freelist.push(Some(storage)) {
                Ok(()) => {
                    self.metrics.available.get_or_create(&label).inc();
                }
                Err(_storage) => {
                    // Freelist full, storage is dropped and deallocated
                }
            }
        }
        // Capacity matches no class - storage is dropped and deallocated
    }
}

/// A pool of reusable, aligned block storage.
///
/// Storage is organized into power-of-two size classes; a request is served
/// by the smallest class that fits. Storage returns to the pool when the last
/// holder of a block (or of any snapshot taken from it) drops.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("config", &self.inner.config)
            .field("num_classes", &self.inner.classes.len())
            .finish()
    }
}

impl BlockPool {
    /// Creates a new block pool with the given configuration.
    ///
    /// Pool metrics are registered against `registry`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(config: PoolConfig, registry: &mut Registry) -> Self {
        config.validate();

        let metrics = PoolMetrics::new(registry);

        let mut classes = Vec::with_capacity(config.num_classes());
        for i in 0..config.num_classes() {
            let size = config.class_size(i);
            let class = SizeClass::new(
                size,
                config.alignment.get(),
                config.max_per_class.get(),
                config.prefill,
            );
            classes.push(class);
        }

        // Update available metrics after prefill
        if config.prefill {
            for class in &classes {
                let label = SizeClassLabel {
                    size_class: class.size as u64,
                };
                let available = class.freelist.len() as i64;
                metrics.available.get_or_create(&label).set(available);
            }
        }

        Self {
            inner: Arc::new(PoolInner {
                config,
                classes,
                metrics,
            }),
        }
    }

    /// Allocates a writable block with at least the given capacity.
    ///
    /// The block's window is zero-initialized and its capacity is the size
    /// of the chosen class. If the pool cannot serve the request (capacity
    /// above `max_size` or class exhausted), falls back to an untracked
    /// aligned allocation that is deallocated instead of recycled.
    ///
    /// Use [`Self::try_alloc`] to distinguish pooled from untracked blocks.
    pub fn alloc(&self, capacity: usize) -> Block {
        self.try_alloc(capacity).unwrap_or_else(|_| {
            let size = capacity.max(self.inner.config.min_size.get());
            debug!(capacity = size, "allocating untracked block storage");
            let storage = AlignedStorage::zeroed(size, self.inner.config.alignment.get());
            // Weak::new() means the storage is deallocated on release instead
            // of returned to the pool.
            Block::new(storage, Weak::new())
        })
    }

    /// Attempts to allocate a pooled block, returning an error on failure.
    ///
    /// Unlike [`Self::alloc`], this method does not fall back to untracked
    /// allocation.
    ///
    /// # Errors
    ///
    /// - [`Error::Oversized`]: `capacity` exceeds `max_size`
    /// - [`Error::Exhausted`]: pool exhausted for the required size class
    pub fn try_alloc(&self, capacity: usize) -> Result<Block, Error> {
        let class_index = match self.inner.config.class_index(capacity) {
            Some(index) => index,
            None => {
                self.inner.metrics.oversized_total.inc();
                return Err(Error::Oversized {
                    requested: capacity,
                    max: self.inner.config.max_size.get(),
                });
            }
        };

        let storage = self
            .inner
            .try_take(class_index)
            .ok_or_else(|| Error::Exhausted {
                capacity: self.inner.config.class_size(class_index),
            })?;
        Ok(Block::new(storage, Arc::downgrade(&self.inner)))
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

#[cfg(test)]
impl BlockPool {
    /// Number of blocks out of the pool for the class serving `capacity`.
    pub(crate) fn allocated(&self, capacity: usize) -> usize {
        let class_index = self.inner.config.class_index(capacity).unwrap();
        self.inner.classes[class_index]
            .allocated
            .load(Ordering::Relaxed)
    }

    /// Number of reusable freelist entries for the class serving `capacity`.
    pub(crate) fn available(&self, capacity: usize) -> i64 {
        let class_index = self.inner.config.class_index(capacity).unwrap();
        let label = SizeClassLabel {
            size_class: self.inner.classes[class_index].size as u64,
        };
        self.inner.metrics.available.get_or_create(&label).get()
    }
}
