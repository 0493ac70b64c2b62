#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

//! # RKH Core
//!
//! Core types shared by every layer of the RKH framework: signals and event
//! handles, active-object priorities, the scheduler hooks a port supplies,
//! and the fatal-error hook used for unrecoverable defects.
//!
//! Builds without `std` on any target with `alloc`; the platform mutex then
//! needs the `lock-free` feature.

extern crate alloc;

use alloc::string::String;
use core::fmt;

pub mod events;
pub mod port;
pub mod priorities;
pub mod sync;

pub use events::*;
pub use port::*;
pub use priorities::*;

/// RKH framework version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Record describing an unrecoverable defect (malformed state chart, broken
/// reference counting, overflowing queue under a fatal policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal {
    /// Framework module that detected the defect.
    pub module: &'static str,
    /// Human readable description.
    pub message: String,
}

impl Fatal {
    pub fn new(module: &'static str, message: impl Into<String>) -> Self {
        Self {
            module,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.module, self.message)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Fatal {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "[{=str}] {=str}", self.module, self.message.as_str());
    }
}

/// Handler invoked for fatal defects. It may halt, reset or log; if it
/// returns, the operation that detected the defect is abandoned.
pub type FatalHook = fn(&Fatal);

/// Default fatal hook: logs the defect and panics.
pub fn default_fatal_hook(fatal: &Fatal) {
    log::error!("fatal: {fatal}");
    panic!("rkh fatal error: {fatal}");
}
