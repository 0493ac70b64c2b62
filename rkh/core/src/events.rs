//! Event types and signal definitions for the RKH framework
//!
//! An event is a signal plus an optional payload. Static events are plain
//! values (usually `static` items) that are never reclaimed. Pooled events
//! occupy one block of an event pool; their handle records where the block
//! lives and the pool reclaims it once the last holder releases it.

use core::fmt;
use core::num::NonZeroU8;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Type-safe event signal identifier
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u16);

impl Signal {
    /// Transition table terminator, never dispatched
    pub const ANY: Signal = Signal(u16::MAX);
    /// Synthesised after entering a state that owns a completion transition
    pub const COMPLETION: Signal = Signal(u16::MAX - 1);
    /// Synthesised once by state machine initialisation
    pub const CREATION: Signal = Signal(u16::MAX - 2);

    /// Create a new signal from a raw value
    pub const fn new(signal: u16) -> Self {
        Signal(signal)
    }

    /// Get the raw signal value
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Check if this is one of the framework's reserved signals
    pub const fn is_reserved(self) -> bool {
        self.0 >= Self::CREATION.0
    }
}

impl From<u16> for Signal {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY => f.write_str("SIG(ANY)"),
            Self::COMPLETION => f.write_str("SIG(COMPLETION)"),
            Self::CREATION => f.write_str("SIG(CREATION)"),
            Self(raw) => write!(f, "SIG({raw:#06x})"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Signal {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "SIG({=u16:#x})", self.0);
    }
}

/// Identity of whoever allocates, posts or releases an event. Only used for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sender(pub &'static str);

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Event pool identifier: registry index plus one. Zero is reserved for
/// static events, hence the non-zero representation.
pub type PoolId = NonZeroU8;

/// Location of a pooled event.
///
/// `generation` is bumped by the pool every time the block is handed out, so
/// a handle kept past the release of its event no longer matches the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub pool: PoolId,
    pub index: u16,
    pub generation: u16,
}

/// Where an event's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Static event with an optional read-only payload
    Static(&'static [u8]),
    /// Event occupying a block of a registered event pool
    Pooled(BlockRef),
}

/// Event handle passed through queues and into state machines.
///
/// The handle is `Copy`; ownership of pooled storage is tracked by the
/// pool's reference counter, not by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Evt {
    signal: Signal,
    origin: Origin,
}

impl Evt {
    /// Create a static event without payload
    pub const fn new(signal: Signal) -> Self {
        Self {
            signal,
            origin: Origin::Static(&[]),
        }
    }

    /// Create a static event carrying a read-only payload
    pub const fn with_payload(signal: Signal, payload: &'static [u8]) -> Self {
        Self {
            signal,
            origin: Origin::Static(payload),
        }
    }

    /// Handle to an event stored in a pool block. Only event pools create these.
    pub const fn pooled(signal: Signal, block: BlockRef) -> Self {
        Self {
            signal,
            origin: Origin::Pooled(block),
        }
    }

    pub const fn signal(&self) -> Signal {
        self.signal
    }

    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Pool identifier, 0 for static events.
    pub const fn pool_id(&self) -> u8 {
        match self.origin {
            Origin::Static(_) => 0,
            Origin::Pooled(block) => block.pool.get(),
        }
    }

    pub const fn block(&self) -> Option<BlockRef> {
        match self.origin {
            Origin::Static(_) => None,
            Origin::Pooled(block) => Some(block),
        }
    }

    /// Check if this event lives in an event pool
    pub const fn is_dynamic(&self) -> bool {
        matches!(self.origin, Origin::Pooled(_))
    }

    /// Payload of a static event. Pooled payloads are read through the pool.
    pub const fn static_payload(&self) -> Option<&'static [u8]> {
        match self.origin {
            Origin::Static(payload) => Some(payload),
            Origin::Pooled(_) => None,
        }
    }
}

impl fmt::Display for Evt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Origin::Static(_) => write!(f, "{} (static)", self.signal),
            Origin::Pooled(block) => write!(
                f,
                "{} (pool {} block {})",
                self.signal, block.pool, block.index
            ),
        }
    }
}

/// Completion pseudo-event synthesised by the dispatcher
pub const COMPLETION_EVENT: Evt = Evt::new(Signal::COMPLETION);

/// Creation pseudo-event dispatched by state machine initialisation
pub const CREATION_EVENT: Evt = Evt::new(Signal::CREATION);

/// Macro to declare a group of signal constants
///
/// ```
/// rkh_core::signals! {
///     pub SIG_TICK = 1,
///     pub SIG_DATA = 2,
/// }
/// assert_eq!(SIG_DATA.raw(), 2);
/// ```
#[macro_export]
macro_rules! signals {
    ($($vis:vis $name:ident = $value:expr),* $(,)?) => {
        $(
            $vis const $name: $crate::Signal = $crate::Signal::new($value);
        )*
    };
}
