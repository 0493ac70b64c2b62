//! Fixed-block memory pool.
//!
//! Blocks are addressed by index into the pool's storage. The free list is
//! an explicit table of links kept beside the storage, so a free block's
//! bytes are never reinterpreted. Every allocation bumps the block's
//! generation, which lets the pool recognise handles that outlived the
//! allocation they came from.

use crate::{PoolError, PoolResult, PoolStats, PoolUsage};
use alloc::{boxed::Box, vec};
use core::cell::RefCell;
use critical_section::{CriticalSection, Mutex};

/// Alignment unit block sizes are rounded up to
pub const BLOCK_ALIGN: usize = core::mem::size_of::<usize>();

/// Handle to an allocated block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub index: u16,
    pub generation: u16,
}

struct PoolInner {
    storage: Box<[u8]>,
    next: Box<[Option<u16>]>,
    allocated: Box<[bool]>,
    generations: Box<[u16]>,
    head: Option<u16>,
    stats: PoolStats,
    usage: PoolUsage,
}

impl PoolInner {
    fn check(&self, handle: BlockHandle) -> PoolResult<usize> {
        let index = handle.index as usize;
        if index >= self.allocated.len() {
            return Err(PoolError::ForeignBlock {
                index: handle.index,
            });
        }
        if !self.allocated[index] {
            return Err(PoolError::DoubleFree {
                index: handle.index,
            });
        }
        if self.generations[index] != handle.generation {
            return Err(PoolError::StaleHandle {
                index: handle.index,
            });
        }
        Ok(index)
    }
}

/// Memory pool handing out equal-size blocks of one storage buffer
pub struct MemPool {
    block_size: usize,
    total_blocks: usize,
    inner: Mutex<RefCell<PoolInner>>,
}

impl MemPool {
    /// Build a pool over `storage`.
    ///
    /// `block_size` is rounded up to a multiple of [`BLOCK_ALIGN`]. The pool
    /// holds `(storage.len() - block) / block + 1` blocks; trailing bytes
    /// that do not fill a whole block are left unused.
    pub fn new(storage: Box<[u8]>, block_size: usize) -> PoolResult<Self> {
        if block_size == 0 {
            return Err(PoolError::ZeroBlockSize);
        }
        let block = block_size.div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN;
        if storage.len() < block {
            return Err(PoolError::StorageTooSmall {
                storage: storage.len(),
                block,
            });
        }
        let total = (storage.len() - block) / block + 1;
        if total > u16::MAX as usize {
            return Err(PoolError::TooManyBlocks { blocks: total });
        }

        let next = (0..total)
            .map(|i| if i + 1 < total { Some(i as u16 + 1) } else { None })
            .collect();

        Ok(Self {
            block_size: block,
            total_blocks: total,
            inner: Mutex::new(RefCell::new(PoolInner {
                storage,
                next,
                allocated: vec![false; total].into_boxed_slice(),
                generations: vec![0; total].into_boxed_slice(),
                head: Some(0),
                stats: PoolStats::new(block, total),
                usage: PoolUsage::default(),
            })),
        })
    }

    /// Build a pool with freshly allocated storage for `blocks` blocks.
    pub fn with_blocks(blocks: usize, block_size: usize) -> PoolResult<Self> {
        let block = block_size.div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN;
        Self::new(vec![0u8; blocks * block].into_boxed_slice(), block_size)
    }

    /// Take a block from the pool, `None` when exhausted.
    pub fn get(&self) -> Option<BlockHandle> {
        critical_section::with(|cs| self.get_in(cs))
    }

    /// Same as [`get`](Self::get) inside a critical section the caller holds.
    pub fn get_in(&self, cs: CriticalSection<'_>) -> Option<BlockHandle> {
        let mut guard = self.inner.borrow_ref_mut(cs);
        let inner = &mut *guard;
        let Some(index) = inner.head else {
            inner.usage.failed_gets = inner.usage.failed_gets.wrapping_add(1);
            return None;
        };
        let i = index as usize;
        inner.head = inner.next[i].take();
        inner.allocated[i] = true;
        inner.generations[i] = inner.generations[i].wrapping_add(1);
        inner.stats.on_alloc();
        inner.usage.gets = inner.usage.gets.wrapping_add(1);
        Some(BlockHandle {
            index,
            generation: inner.generations[i],
        })
    }

    /// Return a block to the pool.
    ///
    /// Handles that do not address a block of this pool, blocks that are
    /// already free and handles from an earlier allocation of the same
    /// block are rejected and leave the pool untouched.
    pub fn put(&self, handle: BlockHandle) -> PoolResult<()> {
        critical_section::with(|cs| self.put_in(cs, handle))
    }

    pub fn put_in(&self, cs: CriticalSection<'_>, handle: BlockHandle) -> PoolResult<()> {
        let mut guard = self.inner.borrow_ref_mut(cs);
        let inner = &mut *guard;
        let i = inner.check(handle)?;
        inner.allocated[i] = false;
        inner.next[i] = inner.head;
        inner.head = Some(handle.index);
        inner.stats.on_dealloc();
        inner.usage.puts = inner.usage.puts.wrapping_add(1);
        Ok(())
    }

    /// Check that `handle` refers to a block currently handed out
    pub fn is_live(&self, handle: BlockHandle) -> bool {
        critical_section::with(|cs| self.is_live_in(cs, handle))
    }

    pub fn is_live_in(&self, cs: CriticalSection<'_>, handle: BlockHandle) -> bool {
        self.inner.borrow_ref(cs).check(handle).is_ok()
    }

    /// Run `f` over the bytes of an allocated block
    pub fn with_block<R>(&self, handle: BlockHandle, f: impl FnOnce(&[u8]) -> R) -> PoolResult<R> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            let i = inner.check(handle)?;
            let start = i * self.block_size;
            Ok(f(&inner.storage[start..start + self.block_size]))
        })
    }

    /// Run `f` over the mutable bytes of an allocated block
    pub fn with_block_mut<R>(
        &self,
        handle: BlockHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> PoolResult<R> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let i = inner.check(handle)?;
            let start = i * self.block_size;
            Ok(f(&mut inner.storage[start..start + self.block_size]))
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn free_count(&self) -> usize {
        self.stats().free_blocks
    }

    pub fn used_count(&self) -> usize {
        self.stats().used_blocks
    }

    /// Fewest free blocks ever observed
    pub fn low_water_mark(&self) -> usize {
        self.stats().min_free_blocks
    }

    pub fn stats(&self) -> PoolStats {
        critical_section::with(|cs| self.inner.borrow_ref(cs).stats)
    }

    pub fn usage(&self) -> PoolUsage {
        critical_section::with(|cs| self.inner.borrow_ref(cs).usage)
    }

    /// Reset usage counters and the low-water mark
    pub fn clear_info(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.usage = PoolUsage::default();
            inner.stats.min_free_blocks = inner.stats.free_blocks;
        });
    }
}

impl core::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemPool")
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats() {
        let mut stats = PoolStats::new(16, 10);

        assert_eq!(stats.total_blocks, 10);
        assert_eq!(stats.free_blocks, 10);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.min_free_blocks, 10);
        assert!(stats.is_idle());
        assert!(!stats.is_exhausted());

        stats.on_alloc();
        assert_eq!(stats.free_blocks, 9);
        assert_eq!(stats.used_blocks, 1);
        assert_eq!(stats.min_free_blocks, 9);
        assert_eq!(stats.utilization(), 10);

        stats.on_dealloc();
        assert_eq!(stats.free_blocks, 10);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.min_free_blocks, 9);
    }

    #[test]
    fn test_block_size_rounds_up_to_alignment() {
        let pool = MemPool::new(vec![0u8; 64].into_boxed_slice(), 3).unwrap();
        assert_eq!(pool.block_size(), BLOCK_ALIGN);
        assert_eq!(pool.total_blocks(), 64 / BLOCK_ALIGN);
    }

    #[test]
    fn test_block_count_ignores_trailing_bytes() {
        let pool = MemPool::new(vec![0u8; 3 * 16 + 5].into_boxed_slice(), 16).unwrap();
        assert_eq!(pool.total_blocks(), 3);
    }

    #[test]
    fn test_storage_must_hold_one_block() {
        assert_eq!(
            MemPool::new(vec![0u8; 4].into_boxed_slice(), 16).unwrap_err(),
            PoolError::StorageTooSmall {
                storage: 4,
                block: 16
            }
        );
        assert_eq!(
            MemPool::new(vec![0u8; 4].into_boxed_slice(), 0).unwrap_err(),
            PoolError::ZeroBlockSize
        );
    }

    #[test]
    fn test_exhaustion_returns_none_and_counts() {
        let pool = MemPool::with_blocks(2, 8).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(a.index, b.index);
        assert!(pool.get().is_none());
        assert_eq!(pool.usage().failed_gets, 1);
        assert_eq!(pool.low_water_mark(), 0);

        pool.put(a).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.low_water_mark(), 0);
        pool.clear_info();
        assert_eq!(pool.low_water_mark(), 1);
        assert_eq!(pool.usage(), PoolUsage::default());
    }

    #[test]
    fn test_put_rejects_double_free_and_stale_handles() {
        let pool = MemPool::with_blocks(1, 8).unwrap();
        let first = pool.get().unwrap();
        pool.put(first).unwrap();
        assert_eq!(
            pool.put(first),
            Err(PoolError::DoubleFree { index: first.index })
        );

        let second = pool.get().unwrap();
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert_eq!(
            pool.put(first),
            Err(PoolError::StaleHandle { index: first.index })
        );
        assert_eq!(pool.used_count(), 1);
        pool.put(second).unwrap();
    }

    #[test]
    fn test_put_rejects_foreign_blocks() {
        let pool = MemPool::with_blocks(2, 8).unwrap();
        let bogus = BlockHandle {
            index: 7,
            generation: 1,
        };
        assert_eq!(pool.put(bogus), Err(PoolError::ForeignBlock { index: 7 }));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_block_bytes_are_private_to_each_block() {
        let pool = MemPool::with_blocks(2, 8).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        pool.with_block_mut(a, |bytes| bytes.fill(0xAA)).unwrap();
        pool.with_block_mut(b, |bytes| bytes.fill(0x55)).unwrap();
        assert!(pool.with_block(a, |bytes| bytes.iter().all(|&x| x == 0xAA)).unwrap());
        assert!(pool.with_block(b, |bytes| bytes.iter().all(|&x| x == 0x55)).unwrap());
    }
}
