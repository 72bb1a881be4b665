#![forbid(unsafe_code)]

//! Watch registrations and the registry that orders them.
//!
//! # Ordering
//!
//! New watchers are inserted at the front of the registry and a dirty-check
//! pass walks it back to front, so watchers are evaluated in registration
//! order. The pass reads the registry by index on every step instead of
//! iterating a borrow, which lets listeners register or dispose watchers
//! mid-pass. A slot that disappears is skipped; a shift caused by a removal
//! can make the pass revisit or miss an entry, and every structural change
//! clears the `last_dirty` short-circuit so the following pass is a full one.
//!
//! # Invariants
//!
//! 1. A watcher's first evaluation always counts as a change, and its
//!    listener sees the new value as both new and old.
//! 2. `last_dirty` never keeps a watcher alive.
//! 3. Disposing is idempotent.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::equality::Equality;
use crate::scope::Scope;
use crate::value::Value;

pub(crate) type WatchFn = Box<dyn Fn(&Scope) -> Value>;
pub(crate) type ListenerFn = Box<dyn Fn(&Value, &Value, &Scope)>;

/// Last value seen by a watcher.
enum Last {
    /// Never evaluated. Distinct from every real value, `Undefined` included.
    Initial,
    Seen(Value),
}

/// One registered observation.
pub(crate) struct Watcher {
    watch_fn: WatchFn,
    listener: ListenerFn,
    equality: Equality,
    last: RefCell<Last>,
}

impl Watcher {
    pub(crate) fn new(watch_fn: WatchFn, listener: ListenerFn, equality: Equality) -> Self {
        Self {
            watch_fn,
            listener,
            equality,
            last: RefCell::new(Last::Initial),
        }
    }

    pub(crate) fn evaluate(&self, scope: &Scope) -> Value {
        (self.watch_fn)(scope)
    }

    pub(crate) fn has_changed(&self, new: &Value) -> bool {
        match &*self.last.borrow() {
            Last::Initial => true,
            Last::Seen(old) => !self.equality.are_equal(new, old),
        }
    }

    /// Store `new` as the last-seen value and return the old value to hand
    /// to the listener.
    pub(crate) fn record(&self, new: &Value) -> Value {
        let snapshot = self.equality.snapshot(new);
        match self.last.replace(Last::Seen(snapshot)) {
            Last::Initial => new.clone(),
            Last::Seen(old) => old,
        }
    }

    pub(crate) fn notify(&self, new: &Value, old: &Value, scope: &Scope) {
        (self.listener)(new, old, scope);
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = match &*self.last.borrow() {
            Last::Initial => None,
            Last::Seen(v) => Some(v.clone()),
        };
        f.debug_struct("Watcher")
            .field("equality", &self.equality)
            .field("last", &last)
            .finish()
    }
}

/// Ordered watcher storage plus the dirty-watch short-circuit marker.
#[derive(Default)]
pub(crate) struct Registry {
    watchers: RefCell<Vec<Rc<Watcher>>>,
    last_dirty: RefCell<Option<Weak<Watcher>>>,
}

impl Registry {
    pub(crate) fn register(&self, watcher: Rc<Watcher>) {
        self.watchers.borrow_mut().insert(0, watcher);
        self.reset_last_dirty();
    }

    /// Remove `watcher` if it is still registered.
    pub(crate) fn remove(&self, watcher: &Rc<Watcher>) -> bool {
        let mut watchers = self.watchers.borrow_mut();
        let Some(index) = watchers.iter().position(|w| Rc::ptr_eq(w, watcher)) else {
            return false;
        };
        // Release the borrow before the removed watcher can drop, since its
        // closures may own guards that dispose other watchers.
        let removed = watchers.remove(index);
        drop(watchers);
        self.reset_last_dirty();
        drop(removed);
        true
    }

    pub(crate) fn contains(&self, watcher: &Rc<Watcher>) -> bool {
        self.watchers
            .borrow()
            .iter()
            .any(|w| Rc::ptr_eq(w, watcher))
    }

    /// Watcher at `index`, if the registry still has that slot.
    pub(crate) fn get(&self, index: usize) -> Option<Rc<Watcher>> {
        self.watchers.borrow().get(index).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.borrow().len()
    }

    pub(crate) fn reset_last_dirty(&self) {
        self.last_dirty.replace(None);
    }

    pub(crate) fn set_last_dirty(&self, watcher: &Rc<Watcher>) {
        self.last_dirty.replace(Some(Rc::downgrade(watcher)));
    }

    pub(crate) fn is_last_dirty(&self, watcher: &Rc<Watcher>) -> bool {
        self.last_dirty
            .borrow()
            .as_ref()
            .is_some_and(|last| std::ptr::eq(last.as_ptr(), Rc::as_ptr(watcher)))
    }
}

// ---------------------------------------------------------------------------
// Disposal
// ---------------------------------------------------------------------------

/// Handle returned by `Scope::watch*`; removes the watcher when disposed.
///
/// Dropping the disposer does *not* remove the watcher. Use
/// [`into_guard`](Self::into_guard) for drop-based removal.
#[derive(Clone)]
pub struct WatchDisposer {
    registry: Weak<Registry>,
    watcher: Weak<Watcher>,
}

impl WatchDisposer {
    pub(crate) fn new(registry: &Rc<Registry>, watcher: &Rc<Watcher>) -> Self {
        Self {
            registry: Rc::downgrade(registry),
            watcher: Rc::downgrade(watcher),
        }
    }

    /// Remove the watcher. Safe to call from inside a digest, including from
    /// the watcher's own listener. Later calls are no-ops.
    pub fn dispose(&self) {
        let (Some(registry), Some(watcher)) = (self.registry.upgrade(), self.watcher.upgrade())
        else {
            return;
        };
        if registry.remove(&watcher) {
            tracing::trace!(remaining = registry.len(), "watcher disposed");
        }
    }

    /// Whether the watcher is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match (self.registry.upgrade(), self.watcher.upgrade()) {
            (Some(registry), Some(watcher)) => registry.contains(&watcher),
            _ => false,
        }
    }

    /// Convert into a guard that disposes the watcher when dropped.
    pub fn into_guard(self) -> WatchGuard {
        WatchGuard { disposer: self }
    }
}

impl fmt::Debug for WatchDisposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchDisposer")
            .field("active", &self.is_active())
            .finish()
    }
}

/// RAII guard that disposes its watcher on drop.
#[must_use = "dropping this guard removes the watcher"]
pub struct WatchGuard {
    disposer: WatchDisposer,
}

impl WatchGuard {
    /// Whether the watcher is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.disposer.is_active()
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.disposer.dispose();
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard")
            .field("active", &self.is_active())
            .finish()
    }
}
