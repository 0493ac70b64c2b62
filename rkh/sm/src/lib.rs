#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

//! # RKH State Machine Engine
//!
//! Hierarchical state machines following UML statechart semantics:
//! - Entry and exit actions, run in hierarchy order around the least common
//!   ancestor of source and target
//! - Guarded transitions, internal transitions and completion transitions
//! - Choice and conditional pseudostates
//! - Shallow and deep history
//! - Reusable submachines with entry and exit points
//!
//! A [`StateChart`] is an immutable graph built once with a
//! [`ChartBuilder`] and shared between any number of [`StateMachine`]
//! instances. Each instance owns its active state and its history table.

extern crate alloc;

use thiserror::Error;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod chart;
pub mod hsm;
pub mod transition;

pub use chart::*;
pub use hsm::*;
pub use transition::*;


/// Hard ceiling on the nesting depth of a state chart
pub const MAX_HCAL_DEPTH: usize = 16;

/// Hard ceiling on the segments (and actions) of one compound transition
pub const MAX_TRC_SEGS: usize = 16;

/// Hard ceiling on the completion transitions one dispatch may chain
pub const MAX_COMPLETION_CHAIN: usize = 1024;

/// Per-chart bounds checked while dispatching
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmLimits {
    /// Longest state chain entered by one transition
    pub max_hierarchy_depth: usize,
    /// Most segments a compound transition may traverse. Each initial
    /// transition taken while entering composites counts on its own.
    pub max_transition_segments: usize,
    /// Most completion transitions chained by one dispatch; only a chart
    /// whose completion transitions form a cycle should reach it
    pub max_completion_chain: usize,
}

impl SmLimits {
    /// Default completion chain bound
    pub const DEFAULT_COMPLETION_CHAIN: usize = 256;

    pub const fn new(max_hierarchy_depth: usize, max_transition_segments: usize) -> Self {
        Self {
            max_hierarchy_depth,
            max_transition_segments,
            max_completion_chain: Self::DEFAULT_COMPLETION_CHAIN,
        }
    }

    pub const fn with_completion_chain(mut self, max_completion_chain: usize) -> Self {
        self.max_completion_chain = max_completion_chain;
        self
    }

    /// Check that every limit fits its build-time ceiling
    pub const fn is_valid(&self) -> bool {
        self.max_hierarchy_depth > 0
            && self.max_hierarchy_depth <= MAX_HCAL_DEPTH
            && self.max_transition_segments > 0
            && self.max_transition_segments <= MAX_TRC_SEGS
            && self.max_completion_chain > 0
            && self.max_completion_chain <= MAX_COMPLETION_CHAIN
    }
}

impl Default for SmLimits {
    fn default() -> Self {
        Self::new(8, 8)
    }
}

/// Non-fatal outcome of dispatching one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// A transition fired (including internal transitions)
    Processed,
    /// No state in the active configuration handles the signal
    EventNotFound,
    /// A conditional or choice pseudostate had no enabled branch
    ConditionNotFound,
    /// The default transition of an empty history had a false guard
    GuardFalse,
}

impl DispatchStatus {
    pub const fn is_processed(self) -> bool {
        matches!(self, Self::Processed)
    }
}

/// Fatal dispatch failures, all pointing at a malformed state chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("state machine dispatched before init")]
    NotInitialised,
    #[error("compound transition exceeds {limit} segments")]
    TooManySegments { limit: usize },
    #[error("transition enters more than {limit} nested states")]
    HierarchyTooDeep { limit: usize },
    #[error("completion transitions chained more than {limit} times")]
    CompletionLoop { limit: usize },
    #[error("vertex {0} cannot appear in a compound transition here")]
    UnknownState(StateId),
    #[error("target {target} is not nested in {parent}")]
    DetachedTarget { target: StateId, parent: StateId },
}

/// Errors detected while building a state chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChartError {
    #[error("state chart has no initial target")]
    MissingInitial,
    #[error("vertex {0} does not belong to this chart")]
    UnknownVertex(StateId),
    #[error("`{0}` needs a default child")]
    MissingDefault(&'static str),
    #[error("default child of `{0}` is not one of its children")]
    InvalidDefault(&'static str),
    #[error("`{0}` is not a composite state")]
    NotAComposite(&'static str),
    #[error("`{0}` is not a submachine reference")]
    NotAReference(&'static str),
    #[error("`{0}` already has a history pseudostate")]
    DuplicateHistory(&'static str),
    #[error("`{0}` cannot own transitions or actions")]
    NotAState(&'static str),
    #[error("`{0}` has no outgoing branch")]
    EmptyBranches(&'static str),
    #[error("submachine state `{state}` lacks exit connection {index}")]
    MissingExitConnection { state: &'static str, index: usize },
    #[error("reserved signal used as a trigger on `{0}`")]
    ReservedSignal(&'static str),
    #[error("`{state}` is nested {depth} levels deep, limit is {limit}")]
    TooDeep {
        state: &'static str,
        depth: usize,
        limit: usize,
    },
    #[error("state machine limits exceed the build-time ceilings")]
    LimitsOutOfRange,
}
