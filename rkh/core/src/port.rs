//! Scheduler hooks supplied by a platform port.
//!
//! Event queues owned by an active object call these hooks when the queue
//! transitions between empty and non-empty, and when the owner asks for an
//! event while the queue is empty.

use crate::Priority;

/// Hooks a port implements to connect queues to its scheduler.
///
/// `notify_ready` and `notify_unready` are invoked with the queue's critical
/// section held and must not block or call back into the queue.
pub trait SchedulerHooks: Send + Sync {
    /// The queue owned by `priority` received an event.
    fn notify_ready(&self, priority: Priority);

    /// The queue owned by `priority` was drained.
    fn notify_unready(&self, priority: Priority);

    /// The owner of `priority` asked for an event while its queue is empty.
    ///
    /// Threaded ports suspend the caller until the queue becomes non-empty.
    /// Cooperative ports never reach this point, since they only dispatch
    /// ready priorities, so the default treats it as a no-op.
    fn block_until_ready(&self, priority: Priority) {
        log::trace!("block_until_ready({priority}) ignored by cooperative port");
    }
}

/// Hooks for queues nobody schedules (tests, plain buffers).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SchedulerHooks for NoopHooks {
    fn notify_ready(&self, _priority: Priority) {}

    fn notify_unready(&self, _priority: Priority) {}
}
