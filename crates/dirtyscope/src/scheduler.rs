#![forbid(unsafe_code)]

//! Deferred task scheduling.
//!
//! `eval_async` and `apply_async` need a "run this once the current call stack
//! has unwound" primitive. The scope asks a [`Scheduler`] for that; the host
//! decides when deferred tasks actually run.
//!
//! [`TaskQueue`] is the bundled implementation: a single-threaded FIFO that the
//! host drains from its event loop with [`TaskQueue::run_until_idle`]. Each
//! thread has a default queue ([`TaskQueue::current`]) which backs
//! [`Scope::new`](crate::Scope::new).
//!
//! # Invariants
//!
//! 1. Tasks run in the order they were deferred.
//! 2. A task never runs inside the call that deferred it.
//! 3. Tasks deferred while the queue is being drained run in the same drain,
//!    after everything that was already queued.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce()>;

/// Something that can run a task later, on the current thread.
pub trait Scheduler {
    /// Queue `task` to run after the current synchronous execution unwinds.
    fn defer(&self, task: Task);
}

thread_local! {
    static CURRENT_QUEUE: TaskQueue = TaskQueue::new();
}

/// Single-threaded FIFO event-loop queue.
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl TaskQueue {
    /// Create an empty, independent queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The default queue for this thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT_QUEUE.with(Clone::clone)
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Run the oldest pending task. Returns `false` if there was none.
    pub fn run_next(&self) -> bool {
        // Pop before running so the task can defer more work.
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty or `limit` tasks have run.
    ///
    /// Returns the number of tasks run. The limit keeps a task that always
    /// re-defers itself from spinning forever.
    pub fn run_until_idle(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit && self.run_next() {
            ran += 1;
        }
        if ran == limit && !self.is_idle() {
            tracing::debug!(
                ran,
                pending = self.pending(),
                "task queue drain stopped at limit"
            );
        }
        ran
    }

    /// Drop all pending tasks without running them.
    pub fn clear(&self) {
        self.tasks.borrow_mut().clear();
    }
}

impl Scheduler for TaskQueue {
    fn defer(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn tasks_run_in_fifo_order() {
        let queue = TaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = Rc::clone(&log);
            queue.defer(Box::new(move || log.borrow_mut().push(i)));
        }
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.run_until_idle(usize::MAX), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(queue.is_idle());
    }

    #[test]
    fn defer_does_not_run_inline() {
        let queue = TaskQueue::new();
        let ran = Rc::new(Cell::new(false));
        let r = Rc::clone(&ran);
        queue.defer(Box::new(move || r.set(true)));
        assert!(!ran.get());
        assert!(queue.run_next());
        assert!(ran.get());
        assert!(!queue.run_next());
    }

    #[test]
    fn tasks_deferred_during_drain_run_in_same_drain() {
        let queue = TaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_log = Rc::clone(&log);
        queue.defer(Box::new(move || {
            inner_log.borrow_mut().push("outer");
            let log = Rc::clone(&inner_log);
            inner_queue.defer(Box::new(move || log.borrow_mut().push("inner")));
        }));

        assert_eq!(queue.run_until_idle(10), 2);
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn drain_respects_limit() {
        fn reschedule(queue: TaskQueue, count: Rc<Cell<usize>>) {
            let q = queue.clone();
            queue.defer(Box::new(move || {
                count.set(count.get() + 1);
                reschedule(q, count);
            }));
        }

        let queue = TaskQueue::new();
        let count = Rc::new(Cell::new(0));
        reschedule(queue.clone(), Rc::clone(&count));

        assert_eq!(queue.run_until_idle(5), 5);
        assert_eq!(count.get(), 5);
        assert_eq!(queue.pending(), 1);
        queue.clear();
        assert!(queue.is_idle());
    }

    #[test]
    fn current_is_shared_per_thread() {
        let a = TaskQueue::current();
        let b = TaskQueue::current();
        a.defer(Box::new(|| {}));
        assert_eq!(b.pending(), a.pending());
        a.clear();
    }
}
