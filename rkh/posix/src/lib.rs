#![forbid(unsafe_code)]

//! # RKH POSIX Port
//!
//! Runs every active object on its own OS thread. Queues report to
//! [`ThreadHooks`], which parks a thread on a condition variable while its
//! queue is empty and wakes it when an event is posted.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use rkh_core::{Priority, ReadyGroup, SchedulerHooks};
use rkh_fwk::{Framework, FrameworkResult};
use thiserror::Error;

/// Errors reported by the port
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no active object registered at priority {0}")]
    NotRegistered(Priority),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Default)]
struct Flags {
    ready: ReadyGroup,
    shut_down: bool,
}

/// Scheduler hooks backed by a mutex and a condition variable.
#[derive(Debug, Default)]
pub struct ThreadHooks {
    flags: Mutex<Flags>,
    wake: Condvar,
}

impl ThreadHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self, priority: Priority) -> bool {
        self.flags.lock().ready.contains(priority)
    }

    /// Wake every blocked thread and keep them from blocking again
    pub fn shutdown(&self) {
        self.flags.lock().shut_down = true;
        self.wake.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.flags.lock().shut_down
    }
}

impl SchedulerHooks for ThreadHooks {
    fn notify_ready(&self, priority: Priority) {
        self.flags.lock().ready.insert(priority);
        self.wake.notify_all();
    }

    fn notify_unready(&self, priority: Priority) {
        self.flags.lock().ready.remove(priority);
    }

    fn block_until_ready(&self, priority: Priority) {
        let mut flags = self.flags.lock();
        while !flags.ready.contains(priority) && !flags.shut_down {
            self.wake.wait(&mut flags);
        }
    }
}

/// Run the active object at `priority` on a new thread.
///
/// The thread takes events from the object's queue, dispatches them and
/// releases them, until `hooks` shuts down or the object is terminated.
/// It yields the number of events dispatched.
pub fn spawn_active(
    framework: Arc<Framework>,
    hooks: Arc<ThreadHooks>,
    priority: Priority,
) -> Result<JoinHandle<FrameworkResult<usize>>, PortError> {
    let active = framework
        .active(priority)
        .ok_or(PortError::NotRegistered(priority))?;
    let handle = thread::Builder::new()
        .name(format!("rkh-{}", active.name()))
        .spawn(move || {
            let mut dispatched = 0;
            log::debug!("thread of `{}` started", active.name());
            while !hooks.is_shut_down() {
                if active.queue().owner().is_none() {
                    break;
                }
                if let Some(evt) = active.queue().get() {
                    framework.dispatch(active.as_ref(), &evt)?;
                    dispatched += 1;
                }
            }
            log::debug!(
                "thread of `{}` stopped after {} events",
                active.name(),
                dispatched
            );
            Ok(dispatched)
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_notify_ready_wakes_blocked_thread() {
        let hooks = Arc::new(ThreadHooks::new());
        let prio = Priority::new(3).unwrap();
        let waiter = {
            let hooks = hooks.clone();
            thread::spawn(move || hooks.block_until_ready(prio))
        };
        thread::sleep(Duration::from_millis(10));
        hooks.notify_ready(prio);
        waiter.join().unwrap();
        assert!(hooks.is_ready(prio));
    }

    #[test]
    fn test_ready_priority_does_not_block() {
        let hooks = ThreadHooks::new();
        let prio = Priority::new(1).unwrap();
        hooks.notify_ready(prio);
        hooks.block_until_ready(prio);
        hooks.notify_unready(prio);
        assert!(!hooks.is_ready(prio));
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let hooks = Arc::new(ThreadHooks::new());
        let waiters: Vec<_> = (0..3)
            .map(|p| {
                let hooks = hooks.clone();
                thread::spawn(move || hooks.block_until_ready(Priority::new(p).unwrap()))
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        hooks.shutdown();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert!(hooks.is_shut_down());
    }
}
