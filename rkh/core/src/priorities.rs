//! Priority management for active objects

use core::fmt;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of distinct active-object priorities the ready group can track
pub const MAX_PRIORITIES: usize = 64;

/// Type-safe priority level for active objects. Numerically lower values are
/// more urgent: 0 is the highest priority.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Highest priority level
    pub const HIGHEST: Priority = Priority(0);

    /// Lowest priority level the ready group can hold
    pub const LOWEST: Priority = Priority(MAX_PRIORITIES as u8 - 1);

    /// Create a new priority level, rejecting values outside the ready group
    pub const fn new(priority: u8) -> Option<Self> {
        if (priority as usize) < MAX_PRIORITIES {
            Some(Priority(priority))
        } else {
            None
        }
    }

    /// Create priority without validation (const fn)
    pub const fn new_unchecked(priority: u8) -> Self {
        Priority(priority)
    }

    /// Get the raw priority value
    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Check if `self` runs before `other`
    pub const fn is_more_urgent_than(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Priority {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Priority({})", self.0);
    }
}

/// Set of ready priorities, one bit per priority.
///
/// Bit 0 is priority 0, so the most urgent ready priority is the lowest set
/// bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadyGroup(u64);

impl ReadyGroup {
    pub const EMPTY: Self = Self(0);

    pub const fn new() -> Self {
        Self::EMPTY
    }

    /// Mark a priority as ready
    pub fn insert(&mut self, priority: Priority) {
        if priority.index() < MAX_PRIORITIES {
            self.0 |= 1u64 << priority.0;
        }
    }

    /// Mark a priority as no longer ready
    pub fn remove(&mut self, priority: Priority) {
        if priority.index() < MAX_PRIORITIES {
            self.0 &= !(1u64 << priority.0);
        }
    }

    pub const fn contains(&self, priority: Priority) -> bool {
        priority.index() < MAX_PRIORITIES && (self.0 & (1u64 << priority.0)) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn len(&self) -> u32 {
        self.0.count_ones()
    }

    /// Most urgent ready priority
    pub fn highest(&self) -> Option<Priority> {
        if self.is_empty() {
            None
        } else {
            Some(Priority(self.0.trailing_zeros() as u8))
        }
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ReadyGroup {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "ReadyGroup({=u64:b})", self.0);
    }
}

/// Macro to create compile-time priority constants
#[macro_export]
macro_rules! priority {
    ($value:literal) => {{
        const _: () = assert!(($value as usize) < $crate::MAX_PRIORITIES);
        $crate::Priority::new_unchecked($value)
    }};
}
