//! Bounded event queue for active objects.
//!
//! A ring buffer of fixed capacity, allocated once, supporting FIFO and LIFO
//! insertion. When the queue is bound to an owner, the owner's scheduler
//! hooks are told when the queue turns non-empty or drains, and a `get` on
//! an empty queue asks the port to block the owner.
//!
//! Every index update happens inside a critical section, including the
//! owner notification on insertion, so producers in interrupt context and
//! several producer threads may share one queue.

use crate::{QueueError, QueueResult};
use alloc::boxed::Box;
use core::cell::RefCell;
use critical_section::{CriticalSection, Mutex};
use rkh_core::sync::Arc;
use rkh_core::{Priority, SchedulerHooks};

/// Queue usage counters
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueUsage {
    pub puts: u32,
    pub gets: u32,
    pub reads: u32,
    /// Get or peek attempts on an empty queue
    pub empty_hits: u32,
    /// Rejected insertions
    pub full_hits: u32,
}

/// Scheduler binding of a queue owned by an active object
#[derive(Clone)]
struct Owner {
    priority: Priority,
    hooks: Arc<dyn SchedulerHooks>,
}

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    count: usize,
    min_free: usize,
    usage: QueueUsage,
    owner: Option<Owner>,
}

impl<T: Copy> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn reject_if_full(&mut self) -> QueueResult<()> {
        if self.count >= self.capacity() {
            self.usage.full_hits = self.usage.full_hits.wrapping_add(1);
            return Err(QueueError::Full {
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    fn after_put(&mut self) {
        self.count += 1;
        self.usage.puts = self.usage.puts.wrapping_add(1);
        self.min_free = self.min_free.min(self.capacity() - self.count);
        if let Some(owner) = &self.owner {
            owner.hooks.notify_ready(owner.priority);
        }
    }

    fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            self.usage.empty_hits = self.usage.empty_hits.wrapping_add(1);
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        self.usage.gets = self.usage.gets.wrapping_add(1);
        if self.count == 0 {
            if let Some(owner) = &self.owner {
                owner.hooks.notify_unready(owner.priority);
            }
        }
        item
    }
}

/// Fixed-capacity circular queue of `Copy` items (events, handles).
pub struct Queue<T> {
    inner: Mutex<RefCell<Ring<T>>>,
    capacity: usize,
}

impl<T: Copy> Queue<T> {
    /// Create a queue holding up to `capacity` items
    pub fn new(capacity: usize) -> QueueResult<Self> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let slots = core::iter::repeat_with(|| None).take(capacity).collect();
        Ok(Self {
            inner: Mutex::new(RefCell::new(Ring {
                slots,
                head: 0,
                tail: 0,
                count: 0,
                min_free: capacity,
                usage: QueueUsage::default(),
                owner: None,
            })),
            capacity,
        })
    }

    /// Attach the queue to the active object at `priority`
    pub fn bind(&self, priority: Priority, hooks: Arc<dyn SchedulerHooks>) {
        critical_section::with(|cs| {
            let mut ring = self.inner.borrow_ref_mut(cs);
            if ring.count > 0 {
                hooks.notify_ready(priority);
            }
            ring.owner = Some(Owner { priority, hooks });
        });
    }

    /// Detach the queue from its owner
    pub fn unbind(&self) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).owner = None);
    }

    /// Priority of the owner, if bound
    pub fn owner(&self) -> Option<Priority> {
        critical_section::with(|cs| {
            self.inner
                .borrow_ref(cs)
                .owner
                .as_ref()
                .map(|o| o.priority)
        })
    }

    /// Insert at the tail
    pub fn put_fifo(&self, item: T) -> QueueResult<()> {
        critical_section::with(|cs| self.put_fifo_in(cs, item))
    }

    pub fn put_fifo_in(&self, cs: CriticalSection<'_>, item: T) -> QueueResult<()> {
        let mut guard = self.inner.borrow_ref_mut(cs);
        let ring = &mut *guard;
        ring.reject_if_full()?;
        ring.slots[ring.tail] = Some(item);
        ring.tail = (ring.tail + 1) % ring.capacity();
        ring.after_put();
        Ok(())
    }

    /// Insert at the head, ahead of everything queued
    pub fn put_lifo(&self, item: T) -> QueueResult<()> {
        critical_section::with(|cs| self.put_lifo_in(cs, item))
    }

    pub fn put_lifo_in(&self, cs: CriticalSection<'_>, item: T) -> QueueResult<()> {
        let mut guard = self.inner.borrow_ref_mut(cs);
        let ring = &mut *guard;
        ring.reject_if_full()?;
        ring.head = ring.head.checked_sub(1).unwrap_or(ring.capacity() - 1);
        ring.slots[ring.head] = Some(item);
        ring.after_put();
        Ok(())
    }

    /// Remove the head item without blocking
    pub fn try_get(&self) -> nb::Result<T, core::convert::Infallible> {
        critical_section::with(|cs| self.try_get_in(cs))
    }

    pub fn try_get_in(&self, cs: CriticalSection<'_>) -> nb::Result<T, core::convert::Infallible> {
        self.inner
            .borrow_ref_mut(cs)
            .pop()
            .ok_or(nb::Error::WouldBlock)
    }

    /// Remove the head item.
    ///
    /// When the queue is empty and bound to an owner, the port is asked to
    /// block the owner until something is posted. Returns `None` if the
    /// queue is still empty afterwards or has no owner.
    pub fn get(&self) -> Option<T> {
        let waiting = critical_section::with(|cs| {
            let mut ring = self.inner.borrow_ref_mut(cs);
            if ring.count > 0 {
                return Err(ring.pop());
            }
            match &ring.owner {
                Some(owner) => Ok(owner.clone()),
                None => Err(ring.pop()),
            }
        });
        match waiting {
            Err(item) => item,
            Ok(owner) => {
                owner.hooks.block_until_ready(owner.priority);
                self.try_get().ok()
            }
        }
    }

    /// Copy of the head item, leaving it queued
    pub fn peek(&self) -> Option<T> {
        critical_section::with(|cs| {
            let mut guard = self.inner.borrow_ref_mut(cs);
            let ring = &mut *guard;
            if ring.count == 0 {
                ring.usage.empty_hits = ring.usage.empty_hits.wrapping_add(1);
                return None;
            }
            ring.usage.reads = ring.usage.reads.wrapping_add(1);
            ring.slots[ring.head]
        })
    }

    /// Empty the queue at once. Items are dropped without any release; use
    /// [`try_get`](Self::try_get) in a loop to hand them back first.
    pub fn deplete(&self) {
        critical_section::with(|cs| {
            let mut guard = self.inner.borrow_ref_mut(cs);
            let ring = &mut *guard;
            ring.slots.iter_mut().for_each(|slot| *slot = None);
            ring.head = 0;
            ring.tail = 0;
            ring.count = 0;
            if let Some(owner) = &ring.owner {
                owner.hooks.notify_unready(owner.priority);
            }
        });
        log::trace!("queue depleted");
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fewest free slots ever observed
    pub fn low_water_mark(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).min_free)
    }

    pub fn usage(&self) -> QueueUsage {
        critical_section::with(|cs| self.inner.borrow_ref(cs).usage)
    }

    pub fn clear_info(&self) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).usage = QueueUsage::default());
    }
}

impl<T> core::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        critical_section::with(|cs| {
            let ring = self.inner.borrow_ref(cs);
            f.debug_struct("Queue")
                .field("len", &ring.count)
                .field("capacity", &self.capacity)
                .field("low_water_mark", &ring.min_free)
                .field("owner", &ring.owner.as_ref().map(|o| o.priority))
                .finish()
        })
    }
}
