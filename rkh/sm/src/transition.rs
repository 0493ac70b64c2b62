//! Transition rows, pseudostate branches and the bookkeeping of one
//! compound transition.

use crate::{DispatchError, DispatchStatus, StateId};
use rkh_core::{Evt, Signal};

/// What an action or guard sees: the state machine's extended state and
/// the event being dispatched.
pub struct Context<'a, D> {
    pub me: &'a mut D,
    pub event: &'a Evt,
}

impl<D> Context<'_, D> {
    pub fn signal(&self) -> Signal {
        self.event.signal()
    }
}

/// Entry, exit, transition and initial actions
pub type Action<D> = fn(&mut Context<'_, D>);

/// Transition and branch guards
pub type Guard<D> = fn(&Context<'_, D>) -> bool;

/// Maps the dispatched event to the signal a state's transition table is
/// searched with. A state without one matches on the event's own signal.
pub type Preprocessor<D> = fn(&Context<'_, D>) -> Signal;

/// Guard that always holds, for the last branch of a choice or conditional
pub fn else_guard<D>(_ctx: &Context<'_, D>) -> bool {
    true
}

/// One row of a state's transition table.
///
/// A row without a target is an internal transition: its action runs and
/// the active configuration is left untouched.
pub struct Transition<D> {
    pub(crate) signal: Signal,
    pub(crate) guard: Option<Guard<D>>,
    pub(crate) action: Option<Action<D>>,
    pub(crate) target: Option<StateId>,
}

impl<D> Clone for Transition<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Transition<D> {}

impl<D> Transition<D> {
    /// External transition on `signal` to `target`
    pub fn to(signal: Signal, target: StateId) -> Self {
        Self {
            signal,
            guard: None,
            action: None,
            target: Some(target),
        }
    }

    /// Internal transition on `signal`
    pub fn internal(signal: Signal) -> Self {
        Self {
            signal,
            guard: None,
            action: None,
            target: None,
        }
    }

    /// Completion transition taken once the owning state is done
    pub fn completion(target: StateId) -> Self {
        Self::to(Signal::COMPLETION, target)
    }

    pub fn guard(mut self, guard: Guard<D>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn action(mut self, action: Action<D>) -> Self {
        self.action = Some(action);
        self
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn target(&self) -> Option<StateId> {
        self.target
    }

    pub fn is_internal(&self) -> bool {
        self.target.is_none()
    }

    pub(crate) fn is_enabled(&self, ctx: &Context<'_, D>) -> bool {
        self.guard.map_or(true, |guard| guard(ctx))
    }
}

/// Outgoing branch of a choice, conditional or history default
pub struct Branch<D> {
    pub(crate) guard: Option<Guard<D>>,
    pub(crate) action: Option<Action<D>>,
    pub(crate) target: StateId,
}

impl<D> Clone for Branch<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Branch<D> {}

impl<D> Branch<D> {
    pub fn to(target: StateId) -> Self {
        Self {
            guard: None,
            action: None,
            target,
        }
    }

    /// Branch taken when no earlier branch is enabled
    pub fn otherwise(target: StateId) -> Self {
        Self::to(target).guard(else_guard::<D>)
    }

    pub fn guard(mut self, guard: Guard<D>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn action(mut self, action: Action<D>) -> Self {
        self.action = Some(action);
        self
    }

    pub fn target(&self) -> StateId {
        self.target
    }

    pub(crate) fn is_enabled(&self, ctx: &Context<'_, D>) -> bool {
        self.guard.map_or(true, |guard| guard(ctx))
    }
}

/// Unguarded segment joining a submachine to its container: the effect of
/// an entry point, or of a submachine state's exit connection.
pub struct Connection<D> {
    pub(crate) action: Option<Action<D>>,
    pub(crate) target: StateId,
}

impl<D> Clone for Connection<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Connection<D> {}

impl<D> Connection<D> {
    pub fn to(target: StateId) -> Self {
        Self {
            action: None,
            target,
        }
    }

    pub fn action(mut self, action: Action<D>) -> Self {
        self.action = Some(action);
        self
    }

    pub fn target(&self) -> StateId {
        self.target
    }
}

/// Summary of the last dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Active leaf before the dispatch, `None` for initialisation
    pub source: Option<StateId>,
    /// Active leaf afterwards
    pub target: Option<StateId>,
    /// States exited, over the whole run-to-completion step
    pub exited: usize,
    /// States entered, over the whole run-to-completion step
    pub entered: usize,
    /// Transition segments traversed
    pub segments: usize,
    pub status: DispatchStatus,
}

/// Transition actions accumulated along a compound transition
pub(crate) struct ActionList<D> {
    actions: heapless::Vec<Action<D>, { crate::MAX_TRC_SEGS }>,
    limit: usize,
}

impl<D> ActionList<D> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            actions: heapless::Vec::new(),
            limit,
        }
    }

    pub(crate) fn push(&mut self, action: Option<Action<D>>) -> Result<(), DispatchError> {
        let Some(action) = action else {
            return Ok(());
        };
        if self.actions.len() >= self.limit {
            return Err(DispatchError::TooManySegments { limit: self.limit });
        }
        self.actions
            .push(action)
            .map_err(|_| DispatchError::TooManySegments { limit: self.limit })
    }

    /// Run every accumulated action in order and empty the list
    pub(crate) fn run(&mut self, me: &mut D, event: &Evt) {
        let mut ctx = Context { me, event };
        for action in self.actions.iter() {
            action(&mut ctx);
        }
        self.actions.clear();
    }
}

/// States to enter, collected from the target upward
pub(crate) struct EntryList {
    states: heapless::Vec<StateId, { crate::MAX_HCAL_DEPTH }>,
    limit: usize,
}

impl EntryList {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            states: heapless::Vec::new(),
            limit,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.states.clear();
    }

    pub(crate) fn push(&mut self, state: StateId) -> Result<(), DispatchError> {
        if self.states.len() >= self.limit {
            return Err(DispatchError::HierarchyTooDeep { limit: self.limit });
        }
        self.states
            .push(state)
            .map_err(|_| DispatchError::HierarchyTooDeep { limit: self.limit })
    }

    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }

    /// States in entry order, outermost first
    pub(crate) fn outermost_first(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states.iter().rev().copied()
    }
}
