#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

//! # RKH Memory Management
//!
//! Fixed-block memory pools and the event pool manager built on them.
//!
//! A [`MemPool`] carves one storage buffer, supplied once, into equal-size
//! blocks addressed by index. [`EventPools`] keeps an ordered set of memory
//! pools, routes each event allocation to the first pool whose blocks are
//! large enough and reclaims a block once the last holder of its event
//! releases it.

extern crate alloc;

use thiserror::Error;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod events;
pub mod pools;

pub use events::*;
pub use pools::*;

/// Upper bound on the number of event pools a manager can register
pub const MAX_EVENT_POOLS: usize = 8;

/// Memory pool statistics for debugging and monitoring
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Size in bytes of every block, after rounding
    pub block_size: usize,
    /// Total number of blocks in the pool
    pub total_blocks: usize,
    /// Number of free blocks currently available
    pub free_blocks: usize,
    /// Number of blocks currently in use
    pub used_blocks: usize,
    /// Minimum number of free blocks ever reached
    pub min_free_blocks: usize,
}

impl PoolStats {
    /// Create new pool statistics
    pub const fn new(block_size: usize, total_blocks: usize) -> Self {
        Self {
            block_size,
            total_blocks,
            free_blocks: total_blocks,
            used_blocks: 0,
            min_free_blocks: total_blocks,
        }
    }

    /// Update statistics after allocation
    pub fn on_alloc(&mut self) {
        self.used_blocks += 1;
        self.free_blocks -= 1;
        if self.free_blocks < self.min_free_blocks {
            self.min_free_blocks = self.free_blocks;
        }
    }

    /// Update statistics after deallocation
    pub fn on_dealloc(&mut self) {
        if self.used_blocks > 0 {
            self.used_blocks -= 1;
            self.free_blocks += 1;
        }
    }

    /// Check if every block is handed out
    pub const fn is_exhausted(&self) -> bool {
        self.free_blocks == 0
    }

    /// Check if no block is in use
    pub const fn is_idle(&self) -> bool {
        self.used_blocks == 0
    }

    /// Get utilization as a percentage (0-100)
    pub fn utilization(&self) -> u8 {
        if self.total_blocks == 0 {
            0
        } else {
            ((self.used_blocks * 100) / self.total_blocks) as u8
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PoolStats {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "PoolStats{{ bsize: {}, total: {}, free: {}, used: {}, min_free: {} }}",
            self.block_size,
            self.total_blocks,
            self.free_blocks,
            self.used_blocks,
            self.min_free_blocks
        );
    }
}

/// Usage counters of a memory pool, reset with `clear_info`
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub gets: u32,
    pub puts: u32,
    pub failed_gets: u32,
}

/// Errors reported by memory pools and the event pool manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("block size must be non-zero")]
    ZeroBlockSize,
    #[error("storage of {storage} bytes cannot hold one {block}-byte block")]
    StorageTooSmall { storage: usize, block: usize },
    #[error("pool would hold {blocks} blocks, more than a handle can address")]
    TooManyBlocks { blocks: usize },
    #[error("event pool registry is full ({capacity} pools)")]
    RegistryFull { capacity: usize },
    #[error("pool with {requested}-byte blocks registered after one with {previous}-byte blocks")]
    UnsortedRegistration { previous: usize, requested: usize },
    #[error("no registered pool has blocks of at least {size} bytes")]
    NoPoolFits { size: usize },
    #[error("event pool {pool} is exhausted")]
    Exhausted { pool: u8 },
    #[error("no event pool with id {pool}")]
    UnknownPool { pool: u8 },
    #[error("block {index} does not belong to this pool")]
    ForeignBlock { index: u16 },
    #[error("block {index} is already free")]
    DoubleFree { index: u16 },
    #[error("handle to block {index} outlived its event")]
    StaleHandle { index: u16 },
    #[error("reference count of block {index} would overflow")]
    RefCountOverflow { index: u16 },
    #[error("payload of {len} bytes exceeds the {capacity}-byte block")]
    PayloadTooLarge { len: usize, capacity: usize },
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
