use std::fmt;
use std::mem;
use std::ptr;

use thiserror::Error;

use crate::utils::align8;

/// Byte size of the arena-hosted policy record, kept 8-aligned because the
/// record is self-hosted behind the first shard inside the first block.
pub(crate) const POLICY_SIZE: usize = align8(mem::size_of::<AllocationPolicy>());

/// A chunk of backing memory as handed around between the region and its
/// block allocator. `size` is the actual length of the chunk, which a custom
/// allocator may round up past what was requested.
#[derive(Clone, Copy, Debug)]
pub struct BlockMem {
    pub ptr: *mut u8,
    pub size: usize,
}

impl BlockMem {
    pub(crate) const fn null() -> Self {
        Self {
            ptr: ptr::null_mut(),
            size: 0,
        }
    }
}

/// Custom block allocator hook. Must return memory that is 8-byte aligned
/// and at least as large as requested; it must not fail (the arena's
/// allocation contract is infallible).
pub type BlockAllocFn = fn(usize) -> BlockMem;

/// Custom block deallocator hook, handed back exactly the `(ptr, size)`
/// pairs the matching [`BlockAllocFn`] produced.
pub type BlockDeallocFn = fn(*mut u8, usize);

/// Telemetry sink for a region's allocation activity.
///
/// A collector is installed once, at construction, through
/// [`AllocationPolicy::metrics_collector`] and is never replaced for the
/// lifetime of the region. It may be called from any thread that touches the
/// region, so implementations use interior mutability (atomics, typically).
pub trait MetricsCollector: Sync {
    /// Whether the region should route every allocation through
    /// [`on_alloc`](Self::on_alloc). Returning `false` keeps the lock-free
    /// fast path and only reports reset/destroy totals.
    fn record_allocs(&self) -> bool {
        false
    }

    /// One allocation of `n` bytes. `type_name` is an opaque descriptor
    /// forwarded from the typed allocation entry points; the core never
    /// interprets it.
    fn on_alloc(&self, type_name: Option<&'static str>, n: usize) {
        let _ = (type_name, n);
    }

    /// The region was reset; `space_allocated` is the total bytes it held.
    fn on_reset(&self, space_allocated: u64) {
        let _ = space_allocated;
    }

    /// The region was destroyed; `space_allocated` is the total bytes it
    /// held since construction or the last reset.
    fn on_destroy(&self, space_allocated: u64) {
        let _ = space_allocated;
    }
}

/// Immutable allocation configuration for a [`Region`](crate::Region).
///
/// The region copies the policy by value into its own first block, so the
/// record survives exactly as long as the region and travels with it across
/// [`reset`](crate::Region::reset).
#[derive(Clone, Copy)]
pub struct AllocationPolicy {
    /// Size of the first block a shard allocates. Multiple of 8.
    pub start_block_size: usize,
    /// Cap for geometric block growth. Multiple of 8, `>= start_block_size`.
    pub max_block_size: usize,
    /// Replacement for the default heap block source.
    pub block_alloc: Option<BlockAllocFn>,
    /// Must be provided iff `block_alloc` is.
    pub block_dealloc: Option<BlockDeallocFn>,
    /// Optional telemetry sink.
    pub metrics_collector: Option<&'static dyn MetricsCollector>,
}

impl AllocationPolicy {
    pub const DEFAULT_START_BLOCK_SIZE: usize = 256;
    pub const DEFAULT_MAX_BLOCK_SIZE: usize = 8192;

    pub(crate) fn record_allocs(&self) -> bool {
        self.metrics_collector
            .map_or(false, |collector| collector.record_allocs())
    }
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            start_block_size: Self::DEFAULT_START_BLOCK_SIZE,
            max_block_size: Self::DEFAULT_MAX_BLOCK_SIZE,
            block_alloc: None,
            block_dealloc: None,
            metrics_collector: None,
        }
    }
}

impl fmt::Debug for AllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationPolicy")
            .field("start_block_size", &self.start_block_size)
            .field("max_block_size", &self.max_block_size)
            .field("block_alloc", &self.block_alloc.is_some())
            .field("block_dealloc", &self.block_dealloc.is_some())
            .field("metrics_collector", &self.metrics_collector.is_some())
            .finish()
    }
}

/// Rejected [`PolicyBuilder`] configurations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("block size {0} is not a multiple of 8")]
    UnalignedBlockSize(usize),
    #[error("block sizes must be nonzero")]
    ZeroBlockSize,
    #[error("start block size {start} exceeds max block size {max}")]
    StartExceedsMax { start: usize, max: usize },
}

/// Validating builder for [`AllocationPolicy`].
#[derive(Default)]
pub struct PolicyBuilder {
    policy: AllocationPolicy,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_block_size(mut self, size: usize) -> Self {
        self.policy.start_block_size = size;
        self
    }

    pub fn max_block_size(mut self, size: usize) -> Self {
        self.policy.max_block_size = size;
        self
    }

    /// Installs a custom block source. Both hooks travel together so a block
    /// is always returned to the allocator that produced it.
    pub fn block_allocator(mut self, alloc: BlockAllocFn, dealloc: BlockDeallocFn) -> Self {
        self.policy.block_alloc = Some(alloc);
        self.policy.block_dealloc = Some(dealloc);
        self
    }

    pub fn metrics_collector(mut self, collector: &'static dyn MetricsCollector) -> Self {
        self.policy.metrics_collector = Some(collector);
        self
    }

    pub fn build(self) -> Result<AllocationPolicy, PolicyError> {
        let policy = self.policy;
        for size in [policy.start_block_size, policy.max_block_size] {
            if size == 0 {
                return Err(PolicyError::ZeroBlockSize);
            }
            if size % 8 != 0 {
                return Err(PolicyError::UnalignedBlockSize(size));
            }
        }
        if policy.start_block_size > policy.max_block_size {
            return Err(PolicyError::StartExceedsMax {
                start: policy.start_block_size,
                max: policy.max_block_size,
            });
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        let policy = PolicyBuilder::new().build().unwrap();
        assert_eq!(
            policy.start_block_size,
            AllocationPolicy::DEFAULT_START_BLOCK_SIZE
        );
        assert_eq!(policy.max_block_size, AllocationPolicy::DEFAULT_MAX_BLOCK_SIZE);
        assert!(policy.block_alloc.is_none());
        assert!(!policy.record_allocs());
    }

    #[test]
    fn rejects_unaligned_sizes() {
        let err = PolicyBuilder::new().start_block_size(100).build().unwrap_err();
        assert_eq!(err, PolicyError::UnalignedBlockSize(100));
    }

    #[test]
    fn rejects_zero_sizes() {
        let err = PolicyBuilder::new().max_block_size(0).build().unwrap_err();
        assert_eq!(err, PolicyError::ZeroBlockSize);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = PolicyBuilder::new()
            .start_block_size(4096)
            .max_block_size(256)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            PolicyError::StartExceedsMax {
                start: 4096,
                max: 256
            }
        );
    }

    #[test]
    fn policy_record_size_is_aligned() {
        assert_eq!(POLICY_SIZE % 8, 0);
    }
}
