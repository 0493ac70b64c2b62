#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

//! # RKH Framework
//!
//! The framework layer binds state machines to event queues and priorities:
//!
//! - [`Queue`]: bounded FIFO/LIFO event queue with scheduler notifications
//! - [`Sma`]: state machine application, an active object owning a
//!   [`StateMachine`](rkh_sm::StateMachine), its extended state and a queue
//! - [`Registry`]: priority-indexed table of active objects
//! - [`Framework`]: one framework instance with its event pools, registry,
//!   cooperative scheduler and fatal-error hook
//!
//! Events travel as [`Evt`] handles. Posting takes a reference on a pooled
//! event; the framework drops it once the event has been dispatched, and the
//! last reference returns the block to its pool.

extern crate alloc;

use rkh_mem::PoolError;
use rkh_sm::DispatchError;
use thiserror::Error;

pub mod active;
pub mod framework;
pub mod queue;
pub mod registry;

pub use active::*;
pub use framework::*;
pub use queue::*;
pub use registry::*;

pub use rkh_core::*;


/// Default event queue capacity for active objects
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// Errors reported by [`Queue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue capacity must be at least one")]
    ZeroCapacity,
    #[error("queue full ({capacity} items)")]
    Full { capacity: usize },
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Errors reported by [`Registry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("priority {priority} outside the {max} configured slots")]
    PriorityOutOfRange { priority: Priority, max: usize },
    #[error("priority {0} already taken")]
    PriorityTaken(Priority),
    #[error("no active object registered at priority {0}")]
    NotRegistered(Priority),
}

/// Errors reported when posting, deferring or recalling events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("queue of priority {0} is full")]
    QueueFull(Priority),
    #[error("deferred queue is full")]
    DeferredQueueFull,
    #[error("no active object registered at priority {0}")]
    NotRegistered(Priority),
    #[error("recalled event held {0} references, expected more than one")]
    RecallUnderflow(u8),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Errors reported by [`Framework`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameworkError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Post(#[from] PostError),
    #[error("active object `{name}` failed to dispatch: {source}")]
    Dispatch {
        name: &'static str,
        source: DispatchError,
    },
    #[error("{0} priorities requested, at most {max} supported", max = rkh_core::MAX_PRIORITIES)]
    TooManyActive(usize),
}

pub type FrameworkResult<T> = Result<T, FrameworkError>;
