//! Event pool manager.
//!
//! Pools are registered in non-decreasing block-size order and an
//! allocation takes a block from the first pool large enough for it, so the
//! smallest fitting block is always used. Each block carries an event
//! header (signal, reference count, payload length, sender) kept beside the
//! pool storage.

use crate::{BlockHandle, MemPool, PoolError, PoolResult, PoolStats, MAX_EVENT_POOLS};
use alloc::{boxed::Box, vec};
use core::cell::RefCell;
use critical_section::{CriticalSection, Mutex};
use rkh_core::{BlockRef, Evt, PoolId, Sender, Signal};

/// Per-block bookkeeping for a pooled event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub signal: Signal,
    /// Outstanding holders; 0 until the event is first posted or reserved
    pub ref_count: u8,
    /// Payload length requested at allocation
    pub len: usize,
    pub sender: Option<Sender>,
}

impl EventHeader {
    const EMPTY: Self = Self {
        signal: Signal(0),
        ref_count: 0,
        len: 0,
        sender: None,
    };
}

struct EventPool {
    id: PoolId,
    blocks: MemPool,
    headers: Mutex<RefCell<Box<[EventHeader]>>>,
}

impl EventPool {
    fn handle(block: BlockRef) -> BlockHandle {
        BlockHandle {
            index: block.index,
            generation: block.generation,
        }
    }
}

/// Result of releasing one reference to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Static event, or a pooled event nobody has taken a reference to yet
    Unowned,
    /// Other holders remain; carries the count left
    Retained(u8),
    /// Last holder released the event and its block went back to the pool
    Reclaimed,
}

/// Ordered registry of event pools
pub struct EventPools {
    pools: heapless::Vec<EventPool, MAX_EVENT_POOLS>,
    capacity: usize,
}

impl Default for EventPools {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPools {
    /// Create a registry accepting up to [`MAX_EVENT_POOLS`] pools
    pub const fn new() -> Self {
        Self {
            pools: heapless::Vec::new(),
            capacity: MAX_EVENT_POOLS,
        }
    }

    /// Create a registry accepting at most `capacity` pools
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pools: heapless::Vec::new(),
            capacity: capacity.min(MAX_EVENT_POOLS),
        }
    }

    /// Register a pool of `block_size`-byte events over `storage`.
    ///
    /// Registration order must be non-decreasing in (rounded) block size;
    /// a smaller pool registered after a larger one would never be chosen
    /// for the sizes both could serve, so it is rejected.
    pub fn register(&mut self, storage: Box<[u8]>, block_size: usize) -> PoolResult<PoolId> {
        if self.pools.len() >= self.capacity {
            return Err(PoolError::RegistryFull {
                capacity: self.capacity,
            });
        }
        let blocks = MemPool::new(storage, block_size)?;
        if let Some(last) = self.pools.last() {
            if blocks.block_size() < last.blocks.block_size() {
                return Err(PoolError::UnsortedRegistration {
                    previous: last.blocks.block_size(),
                    requested: blocks.block_size(),
                });
            }
        }

        let id = PoolId::new(self.pools.len() as u8 + 1).ok_or(PoolError::RegistryFull {
            capacity: self.capacity,
        })?;
        let headers = vec![EventHeader::EMPTY; blocks.total_blocks()].into_boxed_slice();
        log::debug!(
            "event pool {} registered: {} blocks of {} bytes",
            id,
            blocks.total_blocks(),
            blocks.block_size()
        );
        self.pools
            .push(EventPool {
                id,
                blocks,
                headers: Mutex::new(RefCell::new(headers)),
            })
            .map_err(|_| PoolError::RegistryFull {
                capacity: self.capacity,
            })?;
        Ok(id)
    }

    /// Register a pool with freshly allocated storage for `blocks` events.
    pub fn register_blocks(&mut self, blocks: usize, block_size: usize) -> PoolResult<PoolId> {
        let block = block_size.div_ceil(crate::BLOCK_ALIGN) * crate::BLOCK_ALIGN;
        self.register(vec![0u8; blocks * block].into_boxed_slice(), block_size)
    }

    /// Number of registered pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn pool(&self, id: u8) -> PoolResult<&EventPool> {
        (id as usize)
            .checked_sub(1)
            .and_then(|i| self.pools.get(i))
            .ok_or(PoolError::UnknownPool { pool: id })
    }

    /// Allocate an event able to carry `size` payload bytes.
    ///
    /// The event starts with no holder: its reference count is 0 until it
    /// is posted or reserved.
    pub fn allocate(&self, size: usize, signal: Signal, sender: Option<Sender>) -> PoolResult<Evt> {
        critical_section::with(|cs| self.allocate_in(cs, size, signal, sender))
    }

    pub fn allocate_in(
        &self,
        cs: CriticalSection<'_>,
        size: usize,
        signal: Signal,
        sender: Option<Sender>,
    ) -> PoolResult<Evt> {
        let pool = self
            .pools
            .iter()
            .find(|p| p.blocks.block_size() >= size)
            .ok_or(PoolError::NoPoolFits { size })?;
        let Some(handle) = pool.blocks.get_in(cs) else {
            log::warn!("event pool {} exhausted allocating {}", pool.id, signal);
            return Err(PoolError::Exhausted {
                pool: pool.id.get(),
            });
        };
        pool.headers.borrow_ref_mut(cs)[handle.index as usize] = EventHeader {
            signal,
            ref_count: 0,
            len: size,
            sender,
        };
        let evt = Evt::pooled(
            signal,
            BlockRef {
                pool: pool.id,
                index: handle.index,
                generation: handle.generation,
            },
        );
        log::trace!("allocated {}", evt);
        Ok(evt)
    }

    /// Allocate an event and copy `payload` into its block
    pub fn allocate_with(
        &self,
        signal: Signal,
        payload: &[u8],
        sender: Option<Sender>,
    ) -> PoolResult<Evt> {
        let evt = self.allocate(payload.len(), signal, sender)?;
        if let Some(block) = evt.block() {
            self.pool(block.pool.get())?
                .blocks
                .with_block_mut(EventPool::handle(block), |bytes| {
                    bytes[..payload.len()].copy_from_slice(payload)
                })?;
        }
        Ok(evt)
    }

    /// Take one more reference to `evt`. Static events are unaffected.
    pub fn reserve(&self, evt: &Evt) -> PoolResult<()> {
        critical_section::with(|cs| self.reserve_in(cs, evt))
    }

    pub fn reserve_in(&self, cs: CriticalSection<'_>, evt: &Evt) -> PoolResult<()> {
        let Some(block) = evt.block() else {
            return Ok(());
        };
        let pool = self.pool(block.pool.get())?;
        Self::check_live(cs, pool, block)?;
        let mut headers = pool.headers.borrow_ref_mut(cs);
        let header = &mut headers[block.index as usize];
        header.ref_count = header
            .ref_count
            .checked_add(1)
            .ok_or(PoolError::RefCountOverflow { index: block.index })?;
        Ok(())
    }

    /// Drop one reference to `evt` (garbage collection).
    ///
    /// With no reference taken yet this does nothing, matching static
    /// events; such an event stays allocated until it is posted and
    /// consumed. The last holder returns the block to its pool.
    pub fn release(&self, evt: &Evt, sender: Option<Sender>) -> PoolResult<Release> {
        critical_section::with(|cs| self.release_in(cs, evt, sender))
    }

    pub fn release_in(
        &self,
        cs: CriticalSection<'_>,
        evt: &Evt,
        sender: Option<Sender>,
    ) -> PoolResult<Release> {
        let Some(block) = evt.block() else {
            return Ok(Release::Unowned);
        };
        let pool = self.pool(block.pool.get())?;
        if let Err(err) = Self::check_live(cs, pool, block) {
            log::warn!("release of {} rejected: {}", evt, err);
            return Err(err);
        }
        let mut headers = pool.headers.borrow_ref_mut(cs);
        let header = &mut headers[block.index as usize];
        match header.ref_count {
            0 => Ok(Release::Unowned),
            1 => {
                *header = EventHeader::EMPTY;
                drop(headers);
                pool.blocks.put_in(cs, EventPool::handle(block))?;
                match sender {
                    Some(sender) => log::trace!("{} reclaimed by {}", evt, sender),
                    None => log::trace!("{} reclaimed", evt),
                }
                Ok(Release::Reclaimed)
            }
            n => {
                header.ref_count = n - 1;
                Ok(Release::Retained(n - 1))
            }
        }
    }

    fn check_live(cs: CriticalSection<'_>, pool: &EventPool, block: BlockRef) -> PoolResult<()> {
        if pool.blocks.is_live_in(cs, EventPool::handle(block)) {
            Ok(())
        } else {
            Err(PoolError::StaleHandle { index: block.index })
        }
    }

    /// Header of a pooled event, `None` for static events
    pub fn header(&self, evt: &Evt) -> PoolResult<Option<EventHeader>> {
        let Some(block) = evt.block() else {
            return Ok(None);
        };
        let pool = self.pool(block.pool.get())?;
        critical_section::with(|cs| {
            Self::check_live(cs, pool, block)?;
            Ok(Some(pool.headers.borrow_ref(cs)[block.index as usize]))
        })
    }

    /// Current reference count, 0 for static events
    pub fn ref_count(&self, evt: &Evt) -> PoolResult<u8> {
        Ok(self.header(evt)?.map_or(0, |h| h.ref_count))
    }

    /// Run `f` over the payload of `evt`: the static payload, or the bytes
    /// requested at allocation for a pooled event
    pub fn with_payload<R>(&self, evt: &Evt, f: impl FnOnce(&[u8]) -> R) -> PoolResult<R> {
        match evt.block() {
            None => Ok(f(evt.static_payload().unwrap_or(&[]))),
            Some(block) => {
                let pool = self.pool(block.pool.get())?;
                let len = critical_section::with(|cs| {
                    pool.headers.borrow_ref(cs)[block.index as usize].len
                });
                pool.blocks
                    .with_block(EventPool::handle(block), |bytes| f(&bytes[..len]))
            }
        }
    }

    /// Run `f` over the writable payload of a pooled event
    pub fn with_payload_mut<R>(
        &self,
        evt: &Evt,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> PoolResult<Option<R>> {
        let Some(block) = evt.block() else {
            return Ok(None);
        };
        let pool = self.pool(block.pool.get())?;
        let len = critical_section::with(|cs| {
            pool.headers.borrow_ref(cs)[block.index as usize].len
        });
        pool.blocks
            .with_block_mut(EventPool::handle(block), |bytes| f(&mut bytes[..len]))
            .map(Some)
    }

    /// Copy the payload of `evt` into `buf`, returning the number of bytes
    pub fn copy_payload(&self, evt: &Evt, buf: &mut [u8]) -> PoolResult<usize> {
        self.with_payload(evt, |bytes| {
            if bytes.len() > buf.len() {
                Err(PoolError::PayloadTooLarge {
                    len: bytes.len(),
                    capacity: buf.len(),
                })
            } else {
                buf[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
        })?
    }

    /// Statistics of the pool with identifier `id`
    pub fn stats(&self, id: PoolId) -> PoolResult<PoolStats> {
        Ok(self.pool(id.get())?.blocks.stats())
    }

    /// Block size of the pool with identifier `id`
    pub fn block_size(&self, id: PoolId) -> PoolResult<usize> {
        Ok(self.pool(id.get())?.blocks.block_size())
    }

    /// Reset usage counters of every pool
    pub fn clear_info(&self) {
        for pool in &self.pools {
            pool.blocks.clear_info();
        }
    }
}

impl core::fmt::Debug for EventPools {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.pools.iter().map(|p| (p.id, p.blocks.stats())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> EventPools {
        let mut pools = EventPools::new();
        pools.register_blocks(4, 8).unwrap();
        pools.register_blocks(2, 32).unwrap();
        pools
    }

    #[test]
    fn test_allocation_picks_smallest_fitting_pool() {
        let pools = pools();
        let small = pools.allocate(4, Signal(1), None).unwrap();
        let large = pools.allocate(20, Signal(2), None).unwrap();
        assert_eq!(small.pool_id(), 1);
        assert_eq!(large.pool_id(), 2);
        assert_eq!(small.signal(), Signal(1));
        assert_eq!(pools.ref_count(&small).unwrap(), 0);
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let pools = pools();
        assert_eq!(
            pools.allocate(33, Signal(1), None),
            Err(PoolError::NoPoolFits { size: 33 })
        );
    }

    #[test]
    fn test_unsorted_registration_is_rejected() {
        let mut pools = EventPools::new();
        pools.register_blocks(2, 32).unwrap();
        assert_eq!(
            pools.register_blocks(2, 8),
            Err(PoolError::UnsortedRegistration {
                previous: 32,
                requested: 8
            })
        );
    }

    #[test]
    fn test_registry_capacity_is_enforced() {
        let mut pools = EventPools::with_capacity(1);
        pools.register_blocks(1, 8).unwrap();
        assert_eq!(
            pools.register_blocks(1, 8),
            Err(PoolError::RegistryFull { capacity: 1 })
        );
    }

    #[test]
    fn test_last_release_reclaims_block() {
        let pools = pools();
        let evt = pools.allocate(4, Signal(1), None).unwrap();
        let id = PoolId::new(1).unwrap();
        pools.reserve(&evt).unwrap();
        pools.reserve(&evt).unwrap();
        assert_eq!(pools.stats(id).unwrap().used_blocks, 1);

        assert_eq!(pools.release(&evt, None), Ok(Release::Retained(1)));
        assert_eq!(pools.release(&evt, None), Ok(Release::Reclaimed));
        assert_eq!(pools.stats(id).unwrap().used_blocks, 0);
        assert_eq!(
            pools.release(&evt, None),
            Err(PoolError::StaleHandle { index: evt.block().unwrap().index })
        );
    }

    #[test]
    fn test_release_without_holder_is_a_no_op() {
        let pools = pools();
        let evt = pools.allocate(4, Signal(1), None).unwrap();
        assert_eq!(pools.release(&evt, None), Ok(Release::Unowned));
        assert!(pools.header(&evt).unwrap().is_some());

        let fixed = Evt::new(Signal(3));
        pools.reserve(&fixed).unwrap();
        assert_eq!(pools.release(&fixed, None), Ok(Release::Unowned));
        assert_eq!(pools.ref_count(&fixed).unwrap(), 0);
    }

    #[test]
    fn test_payload_round_trips_through_block() {
        let pools = pools();
        let evt = pools
            .allocate_with(Signal(5), &[1, 2, 3], Some(Sender("isr")))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(pools.copy_payload(&evt, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(pools.header(&evt).unwrap().unwrap().sender, Some(Sender("isr")));

        pools
            .with_payload_mut(&evt, |bytes| bytes[0] = 9)
            .unwrap();
        assert_eq!(pools.with_payload(&evt, |b| b[0]).unwrap(), 9);

        let mut tiny = [0u8; 2];
        assert_eq!(
            pools.copy_payload(&evt, &mut tiny),
            Err(PoolError::PayloadTooLarge {
                len: 3,
                capacity: 2
            })
        );
    }
}
