#![forbid(unsafe_code)]

//! Phase guard preventing overlapping digest/apply cycles.
//!
//! A scope is in at most one [`Phase`] at a time. [`PhaseSlot::begin`] claims
//! the slot and hands back a [`PhaseGuard`]; the guard releases the slot when
//! dropped, so every exit path (early return, `?`, unwinding) clears it.

use std::cell::Cell;
use std::fmt;

use crate::error::ScopeError;

/// The operation currently running on a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Digest,
    Apply,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Digest => "$digest",
            Self::Apply => "$apply",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage for the active phase of one scope.
#[derive(Debug, Default)]
pub(crate) struct PhaseSlot {
    current: Cell<Option<Phase>>,
}

impl PhaseSlot {
    pub(crate) fn get(&self) -> Option<Phase> {
        self.current.get()
    }

    /// Claim the slot for `phase`.
    ///
    /// Phases are not re-entrant: fails if any phase is active, including
    /// `phase` itself.
    pub(crate) fn begin(&self, phase: Phase) -> Result<PhaseGuard<'_>, ScopeError> {
        if let Some(active) = self.current.get() {
            return Err(ScopeError::PhaseConflict {
                active,
                requested: phase,
            });
        }
        self.current.set(Some(phase));
        Ok(PhaseGuard { slot: self })
    }
}

/// RAII guard that clears the phase on drop.
#[must_use = "dropping this guard clears the phase immediately"]
pub(crate) struct PhaseGuard<'a> {
    slot: &'a PhaseSlot,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.slot.current.set(None);
    }
}
