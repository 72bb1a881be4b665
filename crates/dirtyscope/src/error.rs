#![forbid(unsafe_code)]

//! Error types for scope operations.
//!
//! Two classes of failure exist and they are handled differently:
//!
//! | Failure | Type | Behavior |
//! |---------|------|----------|
//! | Overlapping digest/apply | [`ScopeError::PhaseConflict`] | Returned to the caller |
//! | Digest never settles | [`ScopeError::NonConvergence`] | Returned to the caller |
//! | Watch fn / listener panics | [`WatchError`] | Logged, passed to the error hook, suppressed |

use std::any::Any;
use std::fmt;

use crate::phase::Phase;

/// Structural errors that abort the triggering `digest`/`apply` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// A phase was requested while another one was still active.
    PhaseConflict {
        /// The phase that was already running.
        active: Phase,
        /// The phase the caller tried to begin.
        requested: Phase,
    },
    /// The digest was still dirty (or still had queued async work) after
    /// `ttl` dirty passes.
    NonConvergence {
        /// The iteration budget that was exhausted.
        ttl: usize,
    },
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PhaseConflict { active, .. } => write!(f, "{active} already in progress"),
            Self::NonConvergence { ttl } => {
                write!(f, "{ttl} digest iterations reached; abandoning digest cycle")
            }
        }
    }
}

impl std::error::Error for ScopeError {}

/// Which piece of user code failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// A watch function, while computing the watched value.
    WatchFn,
    /// A listener, while reacting to a change.
    Listener,
    /// A callback registered with `post_digest`.
    PostDigest,
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WatchFn => "watch function",
            Self::Listener => "listener",
            Self::PostDigest => "post-digest callback",
        })
    }
}

/// A failure inside one observer, caught so the digest can continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchError {
    pub source: FailureSource,
    pub message: String,
}

impl WatchError {
    /// Build from a caught panic payload.
    pub(crate) fn from_panic(source: FailureSource, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { source, message }
    }
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.source, self.message)
    }
}

impl std::error::Error for WatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_conflict_names_the_active_phase() {
        let err = ScopeError::PhaseConflict {
            active: Phase::Digest,
            requested: Phase::Apply,
        };
        assert_eq!(err.to_string(), "$digest already in progress");
    }

    #[test]
    fn non_convergence_reports_budget() {
        let err = ScopeError::NonConvergence { ttl: 10 };
        assert_eq!(
            err.to_string(),
            "10 digest iterations reached; abandoning digest cycle"
        );
    }

    #[test]
    fn watch_error_extracts_panic_messages() {
        let static_payload: Box<dyn Any + Send> = Box::new("boom");
        let owned_payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        let other_payload: Box<dyn Any + Send> = Box::new(42_u8);

        let a = WatchError::from_panic(FailureSource::WatchFn, static_payload.as_ref());
        let b = WatchError::from_panic(FailureSource::Listener, owned_payload.as_ref());
        let c = WatchError::from_panic(FailureSource::PostDigest, other_payload.as_ref());

        assert_eq!(a.message, "boom");
        assert_eq!(b.to_string(), "listener failed: owned boom");
        assert_eq!(c.message, "non-string panic payload");
    }
}
