//! Active objects: a state machine, its extended state, an event queue and
//! a priority.

use crate::{Queue, QueueResult};
use core::fmt;
use rkh_core::sync::{Arc, Mutex};
use rkh_core::{Evt, Priority};
use rkh_sm::{DispatchError, DispatchStatus, SmInfo, StateChart, StateId, StateMachine};

/// Object-safe interface the framework schedules.
///
/// Dispatching is serialised per object by its own lock; callers never
/// dispatch one object from two threads at once.
pub trait Active: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> Priority;

    /// Event queue of this object
    fn queue(&self) -> &Queue<Evt>;

    /// Take the state machine's initial transition
    fn init(&self) -> Result<DispatchStatus, DispatchError>;

    /// Dispatch one event to completion
    fn dispatch(&self, event: &Evt) -> Result<DispatchStatus, DispatchError>;

    /// Name of the active leaf state
    fn state_name(&self) -> Option<&'static str>;

    fn info(&self) -> SmInfo;

    fn clear_info(&self);
}

/// Shared handle to an active object
pub type ActiveRef = Arc<dyn Active>;

struct Machine<D> {
    sm: StateMachine<D>,
    data: D,
}

/// State machine application: the active object built from a state chart
/// and the extended state `D` its actions work on.
pub struct Sma<D> {
    name: &'static str,
    priority: Priority,
    queue: Queue<Evt>,
    machine: Mutex<Machine<D>>,
}

impl<D: Send + 'static> Sma<D> {
    pub fn new(
        name: &'static str,
        priority: Priority,
        chart: Arc<StateChart<D>>,
        data: D,
        queue_capacity: usize,
    ) -> QueueResult<Arc<Self>> {
        Ok(Arc::new(Self {
            name,
            priority,
            queue: Queue::new(queue_capacity)?,
            machine: Mutex::new(Machine {
                sm: StateMachine::new(chart),
                data,
            }),
        }))
    }

    /// Run `f` with the extended state
    pub fn with_data<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.machine.lock().data)
    }

    /// Run `f` with the state machine
    pub fn with_machine<R>(&self, f: impl FnOnce(&mut StateMachine<D>) -> R) -> R {
        f(&mut self.machine.lock().sm)
    }

    pub fn current_state(&self) -> Option<StateId> {
        self.machine.lock().sm.current_state()
    }

    /// Check whether `state` is part of the active configuration
    pub fn is_in(&self, state: StateId) -> bool {
        self.machine.lock().sm.is_in(state)
    }
}

impl<D: Send + 'static> Active for Sma<D> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn queue(&self) -> &Queue<Evt> {
        &self.queue
    }

    fn init(&self) -> Result<DispatchStatus, DispatchError> {
        let mut guard = self.machine.lock();
        let Machine { sm, data } = &mut *guard;
        log::debug!("{}: init", self.name);
        sm.init(data)
    }

    fn dispatch(&self, event: &Evt) -> Result<DispatchStatus, DispatchError> {
        let mut guard = self.machine.lock();
        let Machine { sm, data } = &mut *guard;
        let status = sm.dispatch(data, event)?;
        log::trace!(
            "{}: {} -> {:?}, now in {}",
            self.name,
            event,
            status,
            sm.state_name().unwrap_or("?")
        );
        Ok(status)
    }

    fn state_name(&self) -> Option<&'static str> {
        self.machine.lock().sm.state_name()
    }

    fn info(&self) -> SmInfo {
        self.machine.lock().sm.info()
    }

    fn clear_info(&self) {
        self.machine.lock().sm.clear_info();
    }
}

impl<D> fmt::Debug for Sma<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sma")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("queue", &self.queue)
            .finish()
    }
}
