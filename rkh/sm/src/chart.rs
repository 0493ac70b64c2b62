//! State chart graph and its builder.
//!
//! Vertices are stored in one table and referred to by [`StateId`]. The
//! graph is immutable once built; everything that changes at run time
//! (active state, history, active submachine instances) lives in the
//! [`StateMachine`](crate::StateMachine) that executes the chart.

use crate::{Action, Branch, ChartError, Connection, Preprocessor, SmLimits, Transition};
use alloc::vec::Vec;
use core::fmt;
use rkh_core::Signal;

/// Index of a vertex in its state chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(u16);

impl StateId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Vertex kinds, as seen from outside the chart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    Basic,
    Composite,
    Final,
    Choice,
    Conditional,
    ShallowHistory,
    DeepHistory,
    Submachine,
    SubmachineRef,
    EntryPoint,
    ExitPoint,
}

impl VertexKind {
    /// Stable vertices the active configuration can rest in
    pub const fn is_state(self) -> bool {
        matches!(self, Self::Basic | Self::Composite | Self::Final)
    }
}

pub(crate) struct Body<D> {
    pub(crate) entry: Option<Action<D>>,
    pub(crate) exit: Option<Action<D>>,
    pub(crate) preprocessor: Option<Preprocessor<D>>,
    pub(crate) transitions: Vec<Transition<D>>,
}

impl<D> Body<D> {
    fn new() -> Self {
        Self {
            entry: None,
            exit: None,
            preprocessor: None,
            transitions: Vec::new(),
        }
    }

    fn has_completion(&self) -> bool {
        self.transitions
            .iter()
            .any(|t| t.signal == Signal::COMPLETION)
    }
}

pub(crate) enum Kind<D> {
    Basic(Body<D>),
    Composite {
        body: Body<D>,
        default: Option<StateId>,
        initial_action: Option<Action<D>>,
        history: Option<StateId>,
    },
    Final,
    Choice(Vec<Branch<D>>),
    Conditional(Vec<Branch<D>>),
    History {
        deep: bool,
        slot: usize,
        default: Option<Branch<D>>,
    },
    Submachine {
        body: Body<D>,
        reference: StateId,
        exits: Vec<Option<Connection<D>>>,
    },
    Reference {
        slot: usize,
        default: Option<StateId>,
        initial_action: Option<Action<D>>,
    },
    EntryPoint(Connection<D>),
    ExitPoint {
        index: usize,
    },
}

pub(crate) struct Vertex<D> {
    pub(crate) name: &'static str,
    pub(crate) parent: Option<StateId>,
    pub(crate) kind: Kind<D>,
}

impl<D> Vertex<D> {
    pub(crate) fn body(&self) -> Option<&Body<D>> {
        match &self.kind {
            Kind::Basic(body) | Kind::Composite { body, .. } | Kind::Submachine { body, .. } => {
                Some(body)
            }
            _ => None,
        }
    }

    fn body_mut(&mut self) -> Option<&mut Body<D>> {
        match &mut self.kind {
            Kind::Basic(body) | Kind::Composite { body, .. } | Kind::Submachine { body, .. } => {
                Some(body)
            }
            _ => None,
        }
    }

    fn kind(&self) -> VertexKind {
        match &self.kind {
            Kind::Basic(_) => VertexKind::Basic,
            Kind::Composite { .. } => VertexKind::Composite,
            Kind::Final => VertexKind::Final,
            Kind::Choice(_) => VertexKind::Choice,
            Kind::Conditional(_) => VertexKind::Conditional,
            Kind::History { deep: false, .. } => VertexKind::ShallowHistory,
            Kind::History { deep: true, .. } => VertexKind::DeepHistory,
            Kind::Submachine { .. } => VertexKind::Submachine,
            Kind::Reference { .. } => VertexKind::SubmachineRef,
            Kind::EntryPoint(_) => VertexKind::EntryPoint,
            Kind::ExitPoint { .. } => VertexKind::ExitPoint,
        }
    }

    /// Entering this state makes a completion event pending
    pub(crate) fn is_completion_state(&self) -> bool {
        match &self.kind {
            Kind::Basic(body) => body.has_completion(),
            Kind::Final => true,
            _ => false,
        }
    }
}

/// Immutable hierarchical state chart
pub struct StateChart<D> {
    name: &'static str,
    vertices: Vec<Vertex<D>>,
    initial: StateId,
    initial_action: Option<Action<D>>,
    history_slots: usize,
    reference_slots: usize,
    limits: SmLimits,
}

impl<D> StateChart<D> {
    /// Start building a chart called `name`
    pub fn builder(name: &'static str) -> ChartBuilder<D> {
        ChartBuilder::new(name)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Target of the initial transition taken by `init`
    pub fn initial(&self) -> StateId {
        self.initial
    }

    pub(crate) fn initial_action(&self) -> Option<Action<D>> {
        self.initial_action
    }

    pub fn limits(&self) -> SmLimits {
        self.limits
    }

    /// Number of vertices
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex_name(&self, id: StateId) -> &'static str {
        self.vertex(id).name
    }

    pub fn kind(&self, id: StateId) -> VertexKind {
        self.vertex(id).kind()
    }

    /// Parent as declared; submachine internals answer their reference
    pub fn declared_parent(&self, id: StateId) -> Option<StateId> {
        self.vertex(id).parent
    }

    /// Look a vertex up by name
    pub fn find(&self, name: &str) -> Option<StateId> {
        self.vertices
            .iter()
            .position(|v| v.name == name)
            .map(|i| StateId(i as u16))
    }

    /// Transition rows of a state, empty for pseudostates
    pub fn transitions(&self, id: StateId) -> &[Transition<D>] {
        self.vertex(id)
            .body()
            .map(|body| body.transitions.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn vertex(&self, id: StateId) -> &Vertex<D> {
        &self.vertices[id.index()]
    }

    pub(crate) fn history_slots(&self) -> usize {
        self.history_slots
    }

    pub(crate) fn reference_slots(&self) -> usize {
        self.reference_slots
    }

    /// History slot of a history pseudostate
    pub(crate) fn history_slot(&self, id: StateId) -> Option<usize> {
        match self.vertex(id).kind {
            Kind::History { slot, .. } => Some(slot),
            _ => None,
        }
    }
}

impl<D> fmt::Debug for StateChart<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateChart")
            .field("name", &self.name)
            .field("vertices", &self.vertices.len())
            .field("initial", &self.vertex_name(self.initial))
            .field("limits", &self.limits)
            .finish()
    }
}

/// Builder for [`StateChart`].
///
/// Vertex constructors return the new vertex's id so later calls can wire
/// transitions to it. Misuse (actions on a pseudostate, a history under a
/// basic state, ...) is recorded and reported by [`build`](Self::build).
pub struct ChartBuilder<D> {
    name: &'static str,
    vertices: Vec<Vertex<D>>,
    initial: Option<StateId>,
    initial_action: Option<Action<D>>,
    history_slots: usize,
    reference_slots: usize,
    limits: SmLimits,
    error: Option<ChartError>,
}

impl<D> ChartBuilder<D> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            vertices: Vec::new(),
            initial: None,
            initial_action: None,
            history_slots: 0,
            reference_slots: 0,
            limits: SmLimits::default(),
            error: None,
        }
    }

    fn fail(&mut self, error: ChartError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn known(&mut self, id: StateId) -> bool {
        if id.index() < self.vertices.len() {
            true
        } else {
            self.fail(ChartError::UnknownVertex(id));
            false
        }
    }

    fn push(&mut self, name: &'static str, parent: Option<StateId>, kind: Kind<D>) -> StateId {
        if let Some(parent) = parent {
            self.known(parent);
        }
        let id = StateId(self.vertices.len() as u16);
        self.vertices.push(Vertex { name, parent, kind });
        id
    }

    pub fn basic(&mut self, name: &'static str, parent: Option<StateId>) -> StateId {
        self.push(name, parent, Kind::Basic(Body::new()))
    }

    /// Composite state; give it a default child with
    /// [`default_child`](Self::default_child)
    pub fn composite(&mut self, name: &'static str, parent: Option<StateId>) -> StateId {
        self.push(
            name,
            parent,
            Kind::Composite {
                body: Body::new(),
                default: None,
                initial_action: None,
                history: None,
            },
        )
    }

    pub fn final_state(&mut self, name: &'static str, parent: Option<StateId>) -> StateId {
        self.push(name, parent, Kind::Final)
    }

    /// Choice: runs the actions gathered so far, then picks a branch
    pub fn choice(&mut self, name: &'static str, parent: Option<StateId>) -> StateId {
        self.push(name, parent, Kind::Choice(Vec::new()))
    }

    /// Conditional (static branch): picks a branch before any action runs
    pub fn conditional(&mut self, name: &'static str, parent: Option<StateId>) -> StateId {
        self.push(name, parent, Kind::Conditional(Vec::new()))
    }

    pub fn shallow_history(&mut self, name: &'static str, composite: StateId) -> StateId {
        self.history(name, composite, false)
    }

    pub fn deep_history(&mut self, name: &'static str, composite: StateId) -> StateId {
        self.history(name, composite, true)
    }

    fn history(&mut self, name: &'static str, composite: StateId, deep: bool) -> StateId {
        let slot = self.history_slots;
        self.history_slots += 1;
        let id = self.push(
            name,
            Some(composite),
            Kind::History {
                deep,
                slot,
                default: None,
            },
        );
        if !self.known(composite) {
            return id;
        }
        let owner = &mut self.vertices[composite.index()];
        let owner_name = owner.name;
        let error = match &mut owner.kind {
            Kind::Composite { history, .. } if history.is_none() => {
                *history = Some(id);
                None
            }
            Kind::Composite { .. } => Some(ChartError::DuplicateHistory(owner_name)),
            _ => Some(ChartError::NotAComposite(owner_name)),
        };
        if let Some(error) = error {
            self.fail(error);
        }
        id
    }

    /// Reusable submachine body. Its states use the returned id as parent.
    pub fn submachine_ref(&mut self, name: &'static str) -> StateId {
        let slot = self.reference_slots;
        self.reference_slots += 1;
        self.push(
            name,
            None,
            Kind::Reference {
                slot,
                default: None,
                initial_action: None,
            },
        )
    }

    /// State instantiating the submachine `reference`
    pub fn submachine(
        &mut self,
        name: &'static str,
        parent: Option<StateId>,
        reference: StateId,
    ) -> StateId {
        if self.known(reference)
            && !matches!(self.vertices[reference.index()].kind, Kind::Reference { .. })
        {
            let reference_name = self.vertices[reference.index()].name;
            self.fail(ChartError::NotAReference(reference_name));
        }
        self.push(
            name,
            parent,
            Kind::Submachine {
                body: Body::new(),
                reference,
                exits: Vec::new(),
            },
        )
    }

    /// Entry point on a submachine state, leading into its submachine
    pub fn entry_point(
        &mut self,
        name: &'static str,
        submachine: StateId,
        connection: Connection<D>,
    ) -> StateId {
        self.push(name, Some(submachine), Kind::EntryPoint(connection))
    }

    /// Exit point number `index` of a submachine reference
    pub fn exit_point(&mut self, name: &'static str, reference: StateId, index: usize) -> StateId {
        self.push(name, Some(reference), Kind::ExitPoint { index })
    }

    pub fn on_entry(&mut self, state: StateId, action: Action<D>) -> &mut Self {
        if let Some(body) = self.body_mut(state) {
            body.entry = Some(action);
        }
        self
    }

    pub fn on_exit(&mut self, state: StateId, action: Action<D>) -> &mut Self {
        if let Some(body) = self.body_mut(state) {
            body.exit = Some(action);
        }
        self
    }

    /// Signal translation applied before the table of `state` is searched
    pub fn preprocessor(&mut self, state: StateId, preprocessor: Preprocessor<D>) -> &mut Self {
        if let Some(body) = self.body_mut(state) {
            body.preprocessor = Some(preprocessor);
        }
        self
    }

    /// Append a row to the transition table of `state`
    pub fn transition(&mut self, state: StateId, transition: Transition<D>) -> &mut Self {
        if matches!(transition.signal, Signal::ANY | Signal::CREATION) {
            let name = self.name_of(state);
            self.fail(ChartError::ReservedSignal(name));
            return self;
        }
        if let Some(target) = transition.target {
            self.known(target);
        }
        if let Some(body) = self.body_mut(state) {
            body.transitions.push(transition);
        }
        self
    }

    /// Default child of a composite state or submachine reference
    pub fn default_child(&mut self, state: StateId, child: StateId) -> &mut Self {
        if !self.known(state) || !self.known(child) {
            return self;
        }
        match &mut self.vertices[state.index()].kind {
            Kind::Composite { default, .. } | Kind::Reference { default, .. } => {
                *default = Some(child)
            }
            _ => self.fail(ChartError::NotAComposite(self.name_of(state))),
        }
        self
    }

    /// Action of the initial transition of a composite state or submachine
    /// reference
    pub fn initial_action(&mut self, state: StateId, action: Action<D>) -> &mut Self {
        if !self.known(state) {
            return self;
        }
        match &mut self.vertices[state.index()].kind {
            Kind::Composite { initial_action, .. } | Kind::Reference { initial_action, .. } => {
                *initial_action = Some(action)
            }
            _ => self.fail(ChartError::NotAComposite(self.name_of(state))),
        }
        self
    }

    /// Add an outgoing branch to a choice or conditional pseudostate
    pub fn branch(&mut self, pseudostate: StateId, branch: Branch<D>) -> &mut Self {
        if !self.known(pseudostate) || !self.known(branch.target) {
            return self;
        }
        match &mut self.vertices[pseudostate.index()].kind {
            Kind::Choice(branches) | Kind::Conditional(branches) => branches.push(branch),
            _ => self.fail(ChartError::NotAState(self.name_of(pseudostate))),
        }
        self
    }

    /// Default transition taken through a history that has no memory yet
    pub fn history_default(&mut self, history: StateId, branch: Branch<D>) -> &mut Self {
        if !self.known(history) || !self.known(branch.target) {
            return self;
        }
        match &mut self.vertices[history.index()].kind {
            Kind::History { default, .. } => *default = Some(branch),
            _ => self.fail(ChartError::NotAState(self.name_of(history))),
        }
        self
    }

    /// Where the submachine state `state` goes when its submachine leaves
    /// through exit point number `index`
    pub fn exit_connection(
        &mut self,
        state: StateId,
        index: usize,
        connection: Connection<D>,
    ) -> &mut Self {
        if !self.known(state) || !self.known(connection.target) {
            return self;
        }
        match &mut self.vertices[state.index()].kind {
            Kind::Submachine { exits, .. } => {
                if exits.len() <= index {
                    exits.resize(index + 1, None);
                }
                exits[index] = Some(connection);
            }
            _ => self.fail(ChartError::NotAState(self.name_of(state))),
        }
        self
    }

    /// Target and optional action of the chart's initial transition
    pub fn initial(&mut self, target: StateId, action: Option<Action<D>>) -> &mut Self {
        if self.known(target) {
            self.initial = Some(target);
            self.initial_action = action;
        }
        self
    }

    pub fn limits(&mut self, limits: SmLimits) -> &mut Self {
        self.limits = limits;
        self
    }

    fn name_of(&self, id: StateId) -> &'static str {
        self.vertices.get(id.index()).map_or("?", |v| v.name)
    }

    fn body_mut(&mut self, state: StateId) -> Option<&mut Body<D>> {
        if !self.known(state) {
            return None;
        }
        let name = self.vertices[state.index()].name;
        if self.vertices[state.index()].body_mut().is_none() {
            self.fail(ChartError::NotAState(name));
            return None;
        }
        self.vertices[state.index()].body_mut()
    }

    fn depth(&self, mut id: StateId) -> usize {
        let mut depth = 1;
        while let Some(parent) = self.vertices[id.index()].parent {
            depth += 1;
            id = parent;
            if depth > crate::MAX_HCAL_DEPTH {
                break;
            }
        }
        depth
    }

    fn validate(&self) -> Result<StateId, ChartError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if !self.limits.is_valid() {
            return Err(ChartError::LimitsOutOfRange);
        }
        let initial = self.initial.ok_or(ChartError::MissingInitial)?;

        for (i, vertex) in self.vertices.iter().enumerate() {
            let id = StateId(i as u16);
            let depth = self.depth(id);
            if depth > self.limits.max_hierarchy_depth {
                return Err(ChartError::TooDeep {
                    state: vertex.name,
                    depth,
                    limit: self.limits.max_hierarchy_depth,
                });
            }
            match &vertex.kind {
                Kind::Composite { default, .. } | Kind::Reference { default, .. } => {
                    let child = default.ok_or(ChartError::MissingDefault(vertex.name))?;
                    if self.vertices[child.index()].parent != Some(id) {
                        return Err(ChartError::InvalidDefault(vertex.name));
                    }
                }
                Kind::Choice(branches) | Kind::Conditional(branches) if branches.is_empty() => {
                    return Err(ChartError::EmptyBranches(vertex.name));
                }
                Kind::History { .. } => {
                    let parent = vertex.parent.map(|p| &self.vertices[p.index()].kind);
                    if !matches!(parent, Some(Kind::Composite { .. })) {
                        return Err(ChartError::NotAComposite(vertex.name));
                    }
                }
                Kind::EntryPoint(_) => {
                    let parent = vertex.parent.map(|p| &self.vertices[p.index()].kind);
                    if !matches!(parent, Some(Kind::Submachine { .. })) {
                        return Err(ChartError::NotAState(vertex.name));
                    }
                }
                Kind::ExitPoint { .. } => {
                    let parent = vertex.parent.map(|p| &self.vertices[p.index()].kind);
                    if !matches!(parent, Some(Kind::Reference { .. })) {
                        return Err(ChartError::NotAReference(vertex.name));
                    }
                }
                Kind::Submachine {
                    reference, exits, ..
                } => {
                    for exit in &self.vertices {
                        if let (Kind::ExitPoint { index }, Some(parent)) = (&exit.kind, exit.parent)
                        {
                            let connected = exits.get(*index).copied().flatten().is_some();
                            if parent == *reference && !connected {
                                return Err(ChartError::MissingExitConnection {
                                    state: vertex.name,
                                    index: *index,
                                });
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(initial)
    }

    /// Validate the graph and freeze it
    pub fn build(self) -> Result<StateChart<D>, ChartError> {
        let initial = self.validate()?;
        log::debug!(
            "state chart `{}` built: {} vertices, {} history slots",
            self.name,
            self.vertices.len(),
            self.history_slots
        );
        Ok(StateChart {
            name: self.name,
            vertices: self.vertices,
            initial,
            initial_action: self.initial_action,
            history_slots: self.history_slots,
            reference_slots: self.reference_slots,
            limits: self.limits,
        })
    }
}
