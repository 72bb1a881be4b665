#![forbid(unsafe_code)]

//! The dirty-checking scope.
//!
//! A [`Scope`] holds a table of attributes, an ordered set of watchers and two
//! deferred work queues. [`Scope::digest`] re-evaluates every watcher until a
//! full pass finds nothing changed, invoking listeners for each change it sees.
//!
//! # Digest algorithm
//!
//! ```text
//! reset last_dirty; begin $digest
//! loop:
//!     drain async queue (FIFO)
//!     dirty = digest_once()
//!     if !dirty && async queue empty: break
//!     if ttl dirty passes already ran: fail NonConvergence
//! clear phase; run post-digest callbacks
//! ```
//!
//! `digest_once` walks the registry in registration order. Once it reaches,
//! clean, the watcher that was last found dirty, a full lap has passed
//! without new changes and the pass stops early.
//!
//! # Invariants
//!
//! 1. At most one phase is active; every entry point clears its phase on all
//!    exit paths, unwinding included.
//! 2. A panicking watch function or listener is isolated: it is reported and
//!    the pass continues with the next watcher.
//! 3. At most one deferred `eval_async` trigger and one deferred
//!    `apply_async` flush are pending at a time.
//! 4. Expressions queued with `eval_async` during a digest run in that digest.
//!
//! # Failure Modes
//!
//! | Failure | Behavior |
//! |---------|----------|
//! | `digest`/`apply` while a phase is active | `Err(PhaseConflict)`, nothing evaluated |
//! | Watchers keep dirtying each other | `Err(NonConvergence)` after `ttl` dirty passes |
//! | Watch fn / listener / post-digest panic | Logged, hook called, digest continues |
//! | `eval_async` expression panics | Unwinds out of the digest; phase still cleared, rest of the queue rescheduled |
//! | `apply_async` expression panics | Unwinds out of the flush; rest of the queue rescheduled |
//! | Deferred digest fails | Logged at `error` (no caller to return to) |
//!
//! Watch functions and listeners receive the scope by reference. Capturing a
//! clone of the scope inside them creates an `Rc` cycle that outlives the
//! last external handle.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::{Rc, Weak};

use crate::config::ScopeConfig;
use crate::equality::Equality;
use crate::error::{FailureSource, ScopeError, WatchError};
use crate::phase::{Phase, PhaseSlot};
use crate::scheduler::{Scheduler, TaskQueue};
use crate::value::Value;
use crate::watcher::{Registry, WatchDisposer, Watcher};

/// Extra named values passed to [`Scope::eval_with`].
pub type Locals = BTreeMap<String, Value>;

type Expression = Box<dyn FnOnce(&Scope)>;
type ErrorHook = Rc<dyn Fn(&WatchError)>;

/// Pending `eval_async` work.
struct AsyncTask {
    scope: Weak<ScopeInner>,
    expression: Expression,
}

struct ScopeInner {
    attrs: RefCell<BTreeMap<String, Value>>,
    registry: Rc<Registry>,
    async_queue: RefCell<VecDeque<AsyncTask>>,
    apply_async_queue: RefCell<VecDeque<Expression>>,
    apply_async_scheduled: Cell<bool>,
    post_digest_queue: RefCell<VecDeque<Expression>>,
    phase: PhaseSlot,
    config: ScopeConfig,
    scheduler: Rc<dyn Scheduler>,
    error_hook: RefCell<Option<ErrorHook>>,
}

/// Shared handle to a dirty-checking scope.
///
/// Cloning is cheap; every clone refers to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Create a scope with default configuration, scheduling deferred work on
    /// this thread's [`TaskQueue::current`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ScopeConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ScopeConfig) -> Self {
        Self::with_scheduler(config, Rc::new(TaskQueue::current()))
    }

    /// Create a scope that defers work through `scheduler`.
    #[must_use]
    pub fn with_scheduler(config: ScopeConfig, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                attrs: RefCell::new(BTreeMap::new()),
                registry: Rc::new(Registry::default()),
                async_queue: RefCell::new(VecDeque::new()),
                apply_async_queue: RefCell::new(VecDeque::new()),
                apply_async_scheduled: Cell::new(false),
                post_digest_queue: RefCell::new(VecDeque::new()),
                phase: PhaseSlot::default(),
                config: config.sanitized(),
                scheduler,
                error_hook: RefCell::new(None),
            }),
        }
    }

    /// Whether both handles refer to the same scope.
    #[must_use]
    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn config(&self) -> &ScopeConfig {
        &self.inner.config
    }

    /// The phase currently running, if any.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.inner.phase.get()
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    /// Attribute `name`, or [`Value::Undefined`] if unset.
    #[must_use]
    pub fn get(&self, name: &str) -> Value {
        self.inner
            .attrs
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .attrs
            .borrow_mut()
            .insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.inner.attrs.borrow_mut().remove(name)
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.inner.attrs.borrow().contains_key(name)
    }

    /// Replace attribute `name` with `f(current)`.
    pub fn update(&self, name: &str, f: impl FnOnce(Value) -> Value) {
        let current = self.get(name);
        let next = f(current);
        self.set(name, next);
    }

    // -----------------------------------------------------------------------
    // Watch registration
    // -----------------------------------------------------------------------

    /// Watch `watch_fn` by reference equality.
    pub fn watch<W, V, L>(&self, watch_fn: W, listener: L) -> WatchDisposer
    where
        W: Fn(&Scope) -> V + 'static,
        V: Into<Value>,
        L: Fn(&Value, &Value, &Scope) + 'static,
    {
        self.watch_with(Equality::Reference, watch_fn, listener)
    }

    /// Watch `watch_fn` by deep (structural) equality.
    pub fn watch_deep<W, V, L>(&self, watch_fn: W, listener: L) -> WatchDisposer
    where
        W: Fn(&Scope) -> V + 'static,
        V: Into<Value>,
        L: Fn(&Value, &Value, &Scope) + 'static,
    {
        self.watch_with(Equality::Deep, watch_fn, listener)
    }

    /// Watch without a listener. The watch function still runs every pass.
    pub fn watch_only<W, V>(&self, watch_fn: W) -> WatchDisposer
    where
        W: Fn(&Scope) -> V + 'static,
        V: Into<Value>,
    {
        self.watch_with(Equality::Reference, watch_fn, |_, _, _| {})
    }

    /// Register a watcher.
    ///
    /// `listener` is called as `(new, old, scope)` whenever the value returned
    /// by `watch_fn` is judged changed under `equality`. On the first
    /// evaluation `old` is the new value.
    pub fn watch_with<W, V, L>(&self, equality: Equality, watch_fn: W, listener: L) -> WatchDisposer
    where
        W: Fn(&Scope) -> V + 'static,
        V: Into<Value>,
        L: Fn(&Value, &Value, &Scope) + 'static,
    {
        let watcher = Rc::new(Watcher::new(
            Box::new(move |scope: &Scope| -> Value { watch_fn(scope).into() }),
            Box::new(listener),
            equality,
        ));
        let registry = &self.inner.registry;
        registry.register(Rc::clone(&watcher));
        tracing::trace!(?equality, watchers = registry.len(), "watcher registered");
        WatchDisposer::new(registry, &watcher)
    }

    /// Number of registered watchers.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Install a hook receiving every suppressed watcher failure.
    ///
    /// Failures are logged through `tracing` whether or not a hook is set.
    /// Replaces any previous hook.
    pub fn on_watch_error(&self, hook: impl Fn(&WatchError) + 'static) {
        self.inner.error_hook.replace(Some(Rc::new(hook)));
    }

    // -----------------------------------------------------------------------
    // Digest
    // -----------------------------------------------------------------------

    /// Run watchers until none reports a change.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::PhaseConflict`] if a digest or apply is already running.
    /// - [`ScopeError::NonConvergence`] if the scope is still dirty, or still
    ///   has `eval_async` work queued, after `ttl` dirty passes.
    pub fn digest(&self) -> Result<(), ScopeError> {
        let inner = &self.inner;
        inner.registry.reset_last_dirty();
        let guard = inner.phase.begin(Phase::Digest)?;

        let ttl = inner.config.ttl;
        let _span = tracing::trace_span!("digest", watchers = inner.registry.len(), ttl).entered();

        let mut remaining = ttl;
        let mut passes = 0_usize;
        loop {
            self.drain_async_queue();
            let dirty = self.digest_once();
            passes += 1;

            if !dirty && !self.has_pending_async() {
                break;
            }
            if remaining == 0 {
                tracing::warn!(ttl, passes, "digest did not converge");
                return Err(ScopeError::NonConvergence { ttl });
            }
            remaining -= 1;
        }

        drop(guard);
        tracing::debug!(passes, "digest converged");
        self.flush_post_digest();
        Ok(())
    }

    /// One dirty-check pass. Returns whether any watcher changed.
    fn digest_once(&self) -> bool {
        let registry = &self.inner.registry;
        let mut dirty = false;

        // Index from the live registry each step: listeners may register or
        // dispose watchers while the pass is running.
        let mut index = registry.len();
        while index > 0 {
            index -= 1;
            let Some(watcher) = registry.get(index) else {
                continue;
            };

            let new = match catch_unwind(AssertUnwindSafe(|| watcher.evaluate(self))) {
                Ok(value) => value,
                Err(payload) => {
                    self.report(WatchError::from_panic(FailureSource::WatchFn, payload.as_ref()));
                    continue;
                }
            };

            if watcher.has_changed(&new) {
                registry.set_last_dirty(&watcher);
                let old = watcher.record(&new);
                match catch_unwind(AssertUnwindSafe(|| watcher.notify(&new, &old, self))) {
                    Ok(()) => dirty = true,
                    Err(payload) => {
                        self.report(WatchError::from_panic(
                            FailureSource::Listener,
                            payload.as_ref(),
                        ));
                    }
                }
            } else if registry.is_last_dirty(&watcher) {
                // A clean lap back to the last dirty watcher.
                return false;
            }
        }
        dirty
    }

    fn report(&self, error: WatchError) {
        tracing::error!(
            source = %error.source,
            message = %error.message,
            "watcher failed; continuing digest"
        );
        let hook = self.inner.error_hook.borrow().clone();
        if let Some(hook) = hook {
            hook(&error);
        }
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate `expr` against this scope. No phase is entered.
    pub fn eval<R>(&self, expr: impl FnOnce(&Scope) -> R) -> R {
        expr(self)
    }

    /// Evaluate `expr` against this scope and `locals`.
    pub fn eval_with<R>(&self, locals: &Locals, expr: impl FnOnce(&Scope, &Locals) -> R) -> R {
        expr(self, locals)
    }

    /// Queue `expr` to run inside a digest.
    ///
    /// During a digest the expression runs before that digest's next pass.
    /// Otherwise a single deferred trigger is scheduled (if none is pending)
    /// which digests the scope if the queue is still non-empty by then.
    ///
    /// If an expression panics, the panic unwinds out of the digest that
    /// drains it. Expressions still queued behind it get a fresh trigger.
    pub fn eval_async(&self, expr: impl FnOnce(&Scope) + 'static) {
        let inner = &self.inner;
        if inner.phase.get().is_none() && !self.has_pending_async() {
            self.schedule_async_trigger();
        }
        inner.async_queue.borrow_mut().push_back(AsyncTask {
            scope: Rc::downgrade(inner),
            expression: Box::new(expr),
        });
    }

    fn schedule_async_trigger(&self) {
        let weak = Rc::downgrade(&self.inner);
        self.inner.scheduler.defer(Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let scope = Scope { inner };
            if !scope.has_pending_async() {
                return;
            }
            if let Err(err) = scope.digest() {
                tracing::error!(%err, "deferred digest failed");
            }
        }));
    }

    /// Number of queued `eval_async` expressions.
    #[must_use]
    pub fn pending_async(&self) -> usize {
        self.inner.async_queue.borrow().len()
    }

    fn has_pending_async(&self) -> bool {
        !self.inner.async_queue.borrow().is_empty()
    }

    fn drain_async_queue(&self) {
        struct RescheduleOnUnwind<'a>(&'a Scope);
        impl Drop for RescheduleOnUnwind<'_> {
            fn drop(&mut self) {
                if std::thread::panicking() && self.0.has_pending_async() {
                    tracing::debug!(
                        pending = self.0.pending_async(),
                        "eval_async expression panicked; rescheduling the rest"
                    );
                    self.0.schedule_async_trigger();
                }
            }
        }

        let _reschedule = RescheduleOnUnwind(self);
        loop {
            let task = self.inner.async_queue.borrow_mut().pop_front();
            let Some(task) = task else {
                break;
            };
            if let Some(inner) = task.scope.upgrade() {
                (task.expression)(&Scope { inner });
            }
        }
    }

    /// Evaluate `expr` in the `$apply` phase, then digest.
    ///
    /// The digest runs even if `expr` panics; the panic resumes afterwards.
    /// A digest error takes precedence over a pending panic.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::PhaseConflict`] if a phase is active. `expr` does not
    ///   run and no digest is started.
    /// - Any error from the trailing [`digest`](Self::digest).
    pub fn apply<R>(&self, expr: impl FnOnce(&Scope) -> R) -> Result<R, ScopeError> {
        let guard = self.inner.phase.begin(Phase::Apply)?;
        let outcome = catch_unwind(AssertUnwindSafe(|| self.eval(expr)));
        drop(guard);

        self.digest()?;
        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Queue `expr` for a deferred `apply`.
    ///
    /// Calls made before the deferred flush runs are coalesced: the flush
    /// evaluates every queued expression in order, then digests once.
    pub fn apply_async(&self, expr: impl FnOnce(&Scope) + 'static) {
        self.inner
            .apply_async_queue
            .borrow_mut()
            .push_back(Box::new(expr));
        if !self.inner.apply_async_scheduled.replace(true) {
            self.schedule_apply_async_flush();
        }
    }

    /// Number of queued `apply_async` expressions.
    #[must_use]
    pub fn pending_apply_async(&self) -> usize {
        self.inner.apply_async_queue.borrow().len()
    }

    fn schedule_apply_async_flush(&self) {
        let weak = Rc::downgrade(&self.inner);
        self.inner.scheduler.defer(Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let scope = Scope { inner };
            match scope.apply(Scope::flush_apply_async) {
                Ok(()) => {}
                Err(err @ ScopeError::PhaseConflict { .. }) => {
                    tracing::debug!(%err, "apply_async flush deferred again");
                    scope.schedule_apply_async_flush();
                }
                Err(err) => tracing::error!(%err, "deferred apply failed"),
            }
        }));
    }

    fn flush_apply_async(&self) {
        // Runs on unwind too: a panicking expression must not strand the
        // entries queued behind it.
        struct FinishFlush<'a>(&'a Scope);
        impl Drop for FinishFlush<'_> {
            fn drop(&mut self) {
                let scope = self.0;
                if scope.pending_apply_async() == 0 {
                    scope.inner.apply_async_scheduled.set(false);
                } else {
                    tracing::debug!(
                        pending = scope.pending_apply_async(),
                        "apply_async flush interrupted; rescheduling the rest"
                    );
                    scope.schedule_apply_async_flush();
                }
            }
        }

        let _finish = FinishFlush(self);
        let mut flushed = 0_usize;
        loop {
            let expr = self.inner.apply_async_queue.borrow_mut().pop_front();
            let Some(expr) = expr else {
                break;
            };
            expr(self);
            flushed += 1;
        }
        tracing::trace!(flushed, "apply_async queue flushed");
    }

    // -----------------------------------------------------------------------
    // Post-digest
    // -----------------------------------------------------------------------

    /// Run `f` once, after the next digest converges.
    ///
    /// Does not start a digest. A panic in `f` is reported like a watcher
    /// failure and the remaining callbacks still run.
    pub fn post_digest(&self, f: impl FnOnce(&Scope) + 'static) {
        self.inner
            .post_digest_queue
            .borrow_mut()
            .push_back(Box::new(f));
    }

    fn flush_post_digest(&self) {
        loop {
            let f = self.inner.post_digest_queue.borrow_mut().pop_front();
            let Some(f) = f else {
                break;
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(self))) {
                self.report(WatchError::from_panic(
                    FailureSource::PostDigest,
                    payload.as_ref(),
                ));
            }
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("phase", &self.phase())
            .field("watchers", &self.watcher_count())
            .field("attrs", &self.inner.attrs.borrow().len())
            .field("pending_async", &self.pending_async())
            .field("pending_apply_async", &self.pending_apply_async())
            .finish()
    }
}
