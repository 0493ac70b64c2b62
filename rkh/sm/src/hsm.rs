//! Hierarchical state machine dispatcher.
//!
//! One call to [`StateMachine::dispatch`] is one run-to-completion step:
//!
//! 1. find the enabled transition, searching the active leaf first and then
//!    its ancestors;
//! 2. walk the compound transition through its pseudostates, gathering
//!    transition actions;
//! 3. exit states from the active leaf up to the least common ancestor of
//!    source and target, recording shallow history;
//! 4. run the gathered actions, then enter states down to the target;
//! 5. follow initial transitions while the target is composite;
//! 6. record deep history and settle on the new leaf;
//! 7. repeat with a completion event while the new leaf asks for one.

use crate::chart::Kind;
use crate::{
    ActionList, Context, DispatchError, DispatchReport, DispatchStatus, EntryList, StateChart,
    StateId,
};
use alloc::{boxed::Box, sync::Arc, vec};
use rkh_core::{Evt, Signal, COMPLETION_EVENT, CREATION_EVENT};

/// Counters kept per state machine instance
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SmInfo {
    /// Events dispatched, excluding initialisation
    pub received_events: u32,
    /// Run-to-completion steps that fired a transition
    pub executed_transitions: u32,
}

/// Mutable part of a state machine instance
struct Runtime {
    state: Option<StateId>,
    /// Last state remembered by each history pseudostate
    history: Box<[Option<StateId>]>,
    /// Submachine state currently instantiating each submachine reference
    active_submachine: Box<[Option<StateId>]>,
    info: SmInfo,
    last: Option<DispatchReport>,
}

/// Outcome of firing one transition
enum Fired {
    NotFound,
    Stopped(DispatchStatus),
    Done(Step),
}

#[derive(Default)]
struct Step {
    leaf: Option<StateId>,
    exited: usize,
    entered: usize,
    segments: usize,
    completion: bool,
}

/// Instance of a state chart
pub struct StateMachine<D> {
    chart: Arc<StateChart<D>>,
    rt: Runtime,
}

impl<D> StateMachine<D> {
    pub fn new(chart: Arc<StateChart<D>>) -> Self {
        let rt = Runtime {
            state: None,
            history: vec![None; chart.history_slots()].into_boxed_slice(),
            active_submachine: vec![None; chart.reference_slots()].into_boxed_slice(),
            info: SmInfo::default(),
            last: None,
        };
        Self { chart, rt }
    }

    pub fn chart(&self) -> &Arc<StateChart<D>> {
        &self.chart
    }

    /// Active leaf state, `None` before `init`
    pub fn current_state(&self) -> Option<StateId> {
        self.rt.state
    }

    pub fn state_name(&self) -> Option<&'static str> {
        self.rt.state.map(|s| self.chart.vertex_name(s))
    }

    pub fn is_initialised(&self) -> bool {
        self.rt.state.is_some()
    }

    /// Check whether `state` is the active leaf or one of its ancestors
    pub fn is_in(&self, state: StateId) -> bool {
        let mut s = self.rt.state;
        while let Some(current) = s {
            if current == state {
                return true;
            }
            s = self.rt.parent(self.chart.as_ref(), current);
        }
        false
    }

    /// State remembered by a history pseudostate
    pub fn history(&self, history: StateId) -> Option<StateId> {
        self.chart
            .history_slot(history)
            .and_then(|slot| self.rt.history[slot])
    }

    /// Forget what a history pseudostate remembers
    pub fn clear_history(&mut self, history: StateId) {
        if let Some(slot) = self.chart.history_slot(history) {
            self.rt.history[slot] = None;
        }
    }

    pub fn info(&self) -> SmInfo {
        self.rt.info
    }

    pub fn clear_info(&mut self) {
        self.rt.info = SmInfo::default();
    }

    /// Report of the most recent `init` or `dispatch`
    pub fn last_report(&self) -> Option<&DispatchReport> {
        self.rt.last.as_ref()
    }

    /// Take the chart's initial transition and settle in its first active
    /// configuration. Calling it again restarts the machine without exiting
    /// the current configuration.
    pub fn init(&mut self, me: &mut D) -> Result<DispatchStatus, DispatchError> {
        log::trace!(
            "{}: init -> {}",
            self.chart.name(),
            self.chart.vertex_name(self.chart.initial())
        );
        self.rt.state = None;
        self.run(me, &CREATION_EVENT, true)
    }

    /// Dispatch one event to completion
    pub fn dispatch(&mut self, me: &mut D, event: &Evt) -> Result<DispatchStatus, DispatchError> {
        match event.signal() {
            Signal::CREATION => return self.init(me),
            Signal::ANY => return Ok(DispatchStatus::EventNotFound),
            _ => {}
        }
        if self.rt.state.is_none() {
            return Err(DispatchError::NotInitialised);
        }
        self.rt.info.received_events = self.rt.info.received_events.wrapping_add(1);
        self.run(me, event, false)
    }

    fn run(
        &mut self,
        me: &mut D,
        event: &Evt,
        creation: bool,
    ) -> Result<DispatchStatus, DispatchError> {
        let chart = &*self.chart;
        let rt = &mut self.rt;
        let limit = chart.limits().max_completion_chain;
        let mut report = DispatchReport {
            source: rt.state,
            target: rt.state,
            exited: 0,
            entered: 0,
            segments: 0,
            status: DispatchStatus::Processed,
        };

        let initialising = creation;
        let mut evt = *event;
        let mut creation = creation;
        let mut chained = 0usize;
        let status = loop {
            match rt.fire(chart, me, &evt, creation)? {
                Fired::NotFound if chained == 0 => break DispatchStatus::EventNotFound,
                // a completion event nobody handles ends the step
                Fired::NotFound => break DispatchStatus::Processed,
                Fired::Stopped(status) => break status,
                Fired::Done(step) => {
                    report.exited += step.exited;
                    report.entered += step.entered;
                    report.segments += step.segments;
                    if step.leaf.is_some() {
                        report.target = step.leaf;
                    }
                    if !step.completion {
                        break DispatchStatus::Processed;
                    }
                }
            }
            chained += 1;
            if chained > limit {
                return Err(DispatchError::CompletionLoop { limit });
            }
            evt = COMPLETION_EVENT;
            creation = false;
        };

        if status.is_processed() && !initialising {
            rt.info.executed_transitions = rt.info.executed_transitions.wrapping_add(1);
        }
        report.status = status;
        rt.last = Some(report);
        log::trace!(
            "{}: {} -> {:?} ({} exited, {} entered)",
            chart.name(),
            event.signal(),
            status,
            report.exited,
            report.entered
        );
        Ok(status)
    }
}

impl Runtime {
    /// Parent of `state`, resolving a submachine reference to the submachine
    /// state currently instantiating it
    fn parent<D>(&self, chart: &StateChart<D>, state: StateId) -> Option<StateId> {
        let parent = chart.vertex(state).parent?;
        match chart.vertex(parent).kind {
            Kind::Reference { slot, .. } => self.active_submachine[slot],
            _ => Some(parent),
        }
    }

    /// Collect `target` and its ancestors up to, not including, `stop`
    fn collect_entries<D>(
        &self,
        chart: &StateChart<D>,
        target: StateId,
        stop: Option<StateId>,
        entries: &mut EntryList,
    ) -> Result<(), DispatchError> {
        entries.clear();
        let mut s = Some(target);
        while s != stop {
            let Some(state) = s else {
                if let Some(parent) = stop {
                    return Err(DispatchError::DetachedTarget { target, parent });
                }
                break;
            };
            entries.push(state)?;
            s = self.parent(chart, state);
        }
        Ok(())
    }

    fn find_transition<D>(
        &self,
        chart: &StateChart<D>,
        me: &mut D,
        event: &Evt,
        leaf: StateId,
    ) -> Option<(StateId, crate::Transition<D>)> {
        let ctx = Context { me, event };
        let mut s = Some(leaf);
        while let Some(state) = s {
            let signal = chart
                .vertex(state)
                .body()
                .and_then(|body| body.preprocessor)
                .map_or(event.signal(), |preprocess| preprocess(&ctx));
            let found = chart
                .transitions(state)
                .iter()
                .find(|t| t.signal == signal && t.is_enabled(&ctx));
            if let Some(transition) = found {
                return Some((state, *transition));
            }
            s = self.parent(chart, state);
        }
        None
    }

    fn fire<D>(
        &mut self,
        chart: &StateChart<D>,
        me: &mut D,
        event: &Evt,
        creation: bool,
    ) -> Result<Fired, DispatchError> {
        let limits = chart.limits();
        let mut actions = ActionList::new(limits.max_transition_segments);
        let mut entries = EntryList::new(limits.max_hierarchy_depth);
        let mut step = Step::default();

        let leaf = self.state;
        let (mut ets, mut action, mut stn) = if creation {
            let initial = chart.initial();
            (initial, chart.initial_action(), initial)
        } else {
            let Some(leaf) = leaf else {
                return Err(DispatchError::NotInitialised);
            };
            let Some((source, transition)) = self.find_transition(chart, me, event, leaf) else {
                log::trace!(
                    "{}: {} not handled in {}",
                    chart.name(),
                    event.signal(),
                    chart.vertex_name(leaf)
                );
                return Ok(Fired::NotFound);
            };
            let Some(target) = transition.target else {
                log::trace!(
                    "{}: internal transition on {} in {}",
                    chart.name(),
                    event.signal(),
                    chart.vertex_name(source)
                );
                actions.push(transition.action)?;
                actions.run(me, event);
                step.segments = 1;
                step.leaf = Some(leaf);
                return Ok(Fired::Done(step));
            };
            log::trace!(
                "{}: {} fires {} -> {}",
                chart.name(),
                event.signal(),
                chart.vertex_name(source),
                chart.vertex_name(target)
            );
            (target, transition.action, source)
        };

        let mut micro = false;
        loop {
            // the segment budget applies to each compound transition, the
            // initial transitions of entered composites start a new one
            let mut walked = 1;
            actions.push(action)?;
            step.segments += 1;

            // resolve pseudostates until a state is reached
            loop {
                if walked > limits.max_transition_segments {
                    return Err(DispatchError::TooManySegments {
                        limit: limits.max_transition_segments,
                    });
                }
                let vertex = chart.vertex(ets);
                match &vertex.kind {
                    Kind::Basic(_) | Kind::Composite { .. } | Kind::Final => break,
                    Kind::Choice(branches) | Kind::Conditional(branches) => {
                        if matches!(vertex.kind, Kind::Choice(_)) {
                            actions.run(me, event);
                        }
                        let ctx = Context {
                            me: &mut *me,
                            event,
                        };
                        let Some(branch) = branches.iter().find(|b| b.is_enabled(&ctx)) else {
                            log::trace!("{}: no branch of {} enabled", chart.name(), vertex.name);
                            return Ok(Fired::Stopped(DispatchStatus::ConditionNotFound));
                        };
                        actions.push(branch.action)?;
                        ets = branch.target;
                    }
                    Kind::History { slot, default, .. } => {
                        let Some(parent) = vertex.parent else {
                            return Err(DispatchError::UnknownState(ets));
                        };
                        stn = parent;
                        ets = match (self.history[*slot], default) {
                            (Some(remembered), _) => remembered,
                            (None, Some(branch)) => {
                                let ctx = Context {
                                    me: &mut *me,
                                    event,
                                };
                                if !branch.is_enabled(&ctx) {
                                    return Ok(Fired::Stopped(DispatchStatus::GuardFalse));
                                }
                                actions.push(branch.action)?;
                                branch.target
                            }
                            (None, None) => parent,
                        };
                    }
                    Kind::Submachine { reference, .. } => {
                        let Kind::Reference {
                            slot,
                            default,
                            initial_action,
                        } = chart.vertex(*reference).kind
                        else {
                            return Err(DispatchError::UnknownState(*reference));
                        };
                        self.active_submachine[slot] = Some(ets);
                        actions.push(initial_action)?;
                        ets = default.ok_or(DispatchError::UnknownState(*reference))?;
                    }
                    Kind::EntryPoint(connection) => {
                        let Some(submachine) = vertex.parent else {
                            return Err(DispatchError::UnknownState(ets));
                        };
                        let Kind::Submachine { reference, .. } = chart.vertex(submachine).kind
                        else {
                            return Err(DispatchError::UnknownState(submachine));
                        };
                        if let Kind::Reference { slot, .. } = chart.vertex(reference).kind {
                            self.active_submachine[slot] = Some(submachine);
                        }
                        actions.push(connection.action)?;
                        ets = connection.target;
                    }
                    Kind::ExitPoint { index } => {
                        let instance = vertex
                            .parent
                            .and_then(|reference| match chart.vertex(reference).kind {
                                Kind::Reference { slot, .. } => self.active_submachine[slot],
                                _ => None,
                            })
                            .ok_or(DispatchError::UnknownState(ets))?;
                        let Kind::Submachine { exits, .. } = &chart.vertex(instance).kind else {
                            return Err(DispatchError::UnknownState(instance));
                        };
                        let connection = exits
                            .get(*index)
                            .copied()
                            .flatten()
                            .ok_or(DispatchError::UnknownState(ets))?;
                        actions.push(connection.action)?;
                        ets = connection.target;
                    }
                    Kind::Reference { .. } => return Err(DispatchError::UnknownState(ets)),
                }
                walked += 1;
                step.segments += 1;
            }
            let target = ets;

            if micro {
                self.collect_entries(chart, target, Some(stn), &mut entries)?;
            } else if creation {
                self.collect_entries(chart, target, None, &mut entries)?;
            } else if let Some(leaf) = leaf {
                step.exited += self.exit_to(chart, me, event, leaf, target, &mut entries)?;
            }

            actions.run(me, event);

            let mut ctx = Context {
                me: &mut *me,
                event,
            };
            for state in entries.outermost_first() {
                let vertex = chart.vertex(state);
                if let Some(entry) = vertex.body().and_then(|body| body.entry) {
                    entry(&mut ctx);
                }
                log::trace!("{}: entered {}", chart.name(), vertex.name);
            }
            step.entered += entries.len();

            match chart.vertex(target).kind {
                Kind::Composite {
                    default,
                    initial_action,
                    ..
                } => {
                    micro = true;
                    action = initial_action;
                    ets = default.ok_or(DispatchError::UnknownState(target))?;
                    stn = target;
                }
                _ => {
                    self.update_deep_history(chart, target);
                    self.state = Some(target);
                    step.leaf = Some(target);
                    step.completion = chart.vertex(target).is_completion_state();
                    return Ok(Fired::Done(step));
                }
            }
        }
    }

    /// Exit from the active leaf up to the least common ancestor of the
    /// leaf and `target`, leaving in `entries` the states to enter.
    ///
    /// The state found first is always exited even when it is the LCA,
    /// which turns a transition to the leaf itself into exit plus re-entry.
    fn exit_to<D>(
        &mut self,
        chart: &StateChart<D>,
        me: &mut D,
        event: &Evt,
        leaf: StateId,
        target: StateId,
        entries: &mut EntryList,
    ) -> Result<usize, DispatchError> {
        let mut exited = 0;
        let mut stx = Some(leaf);
        while let Some(x) = stx {
            entries.clear();
            let mut is_lca = false;
            let mut stn = Some(target);
            while let Some(n) = stn {
                if n == x {
                    is_lca = true;
                    break;
                }
                entries.push(n)?;
                stn = self.parent(chart, n);
            }

            if is_lca && exited > 0 {
                break;
            }
            self.exit_state(chart, me, event, x);
            exited += 1;
            if is_lca {
                entries.push(x)?;
                break;
            }
            stx = self.parent(chart, x);
        }
        Ok(exited)
    }

    fn exit_state<D>(&mut self, chart: &StateChart<D>, me: &mut D, event: &Evt, state: StateId) {
        let vertex = chart.vertex(state);
        if let Some(exit) = vertex.body().and_then(|body| body.exit) {
            exit(&mut Context { me, event });
        }
        log::trace!("{}: exited {}", chart.name(), vertex.name);

        let Some(parent) = vertex.parent else {
            return;
        };
        if let Kind::Composite {
            history: Some(h), ..
        } = chart.vertex(parent).kind
        {
            if let Kind::History {
                deep: false, slot, ..
            } = chart.vertex(h).kind
            {
                self.history[slot] = Some(state);
            }
        }
    }

    fn update_deep_history<D>(&mut self, chart: &StateChart<D>, leaf: StateId) {
        let mut s = self.parent(chart, leaf);
        while let Some(state) = s {
            if let Kind::Composite {
                history: Some(h), ..
            } = chart.vertex(state).kind
            {
                if let Kind::History {
                    deep: true, slot, ..
                } = chart.vertex(h).kind
                {
                    self.history[slot] = Some(leaf);
                }
            }
            s = self.parent(chart, state);
        }
    }
}

impl<D> core::fmt::Debug for StateMachine<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateMachine")
            .field("chart", &self.chart.name())
            .field("state", &self.state_name())
            .field("info", &self.rt.info)
            .finish()
    }
}
