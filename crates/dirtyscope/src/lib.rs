#![forbid(unsafe_code)]

//! Dirty-checking change detection.
//!
//! A [`Scope`] lets observers register interest in computed values and be
//! notified, synchronously and deterministically, when those values change:
//!
//! - [`Scope::watch`] registers a watch function plus a listener and returns
//!   a [`WatchDisposer`].
//! - [`Scope::digest`] re-evaluates every watcher until a full pass finds
//!   nothing changed, or fails with [`ScopeError::NonConvergence`].
//! - [`Scope::apply`] evaluates an expression and then digests.
//! - [`Scope::eval_async`] and [`Scope::apply_async`] queue work for a
//!   deferred digest through a [`Scheduler`].
//!
//! # Architecture
//!
//! `Scope` is an `Rc` handle for single-threaded shared ownership. Watchers
//! live in an ordered registry that listeners may mutate mid-digest; the
//! registry is indexed afresh on every step of a pass instead of being
//! borrowed for the whole pass. Values are [`Value`]s so that identity and
//! structural equality are both expressible.
//!
//! # Example
//!
//! ```
//! use dirtyscope::{Scope, Value};
//!
//! let scope = Scope::new();
//! scope.watch(
//!     |s| s.get("name"),
//!     |new, _old, s| s.set("greeting", format!("hello {}", new.as_str().unwrap_or("?"))),
//! );
//!
//! scope.apply(|s| s.set("name", "ada")).unwrap();
//! assert_eq!(scope.get("greeting").as_str(), Some("hello ada"));
//! ```
//!
//! # Invariants
//!
//! 1. Watchers are evaluated in registration order.
//! 2. A listener fires at most once per change per pass, and on its first
//!    call receives the new value as the old value.
//! 3. One failing watcher never stops the digest.
//! 4. `digest`/`apply` never overlap on one scope.

pub mod config;
pub mod equality;
pub mod error;
pub mod phase;
pub mod scheduler;
pub mod scope;
pub mod value;
pub mod watcher;

pub use config::{DEFAULT_TTL, ScopeConfig};
pub use equality::Equality;
pub use error::{FailureSource, ScopeError, WatchError};
pub use phase::Phase;
pub use scheduler::{Scheduler, Task, TaskQueue};
pub use scope::{Locals, Scope};
pub use value::{List, Map, Value};
pub use watcher::{WatchDisposer, WatchGuard};
