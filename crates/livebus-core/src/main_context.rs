#![forbid(unsafe_code)]

//! Main-context marshalling.
//!
//! All channel state is mutated on one serialized execution context, the
//! *main context*. Producers on other threads reach it by submitting
//! [`Task`]s through a [`MainExecutor`].
//!
//! [`MainContext`] is the bundled executor: a task queue bound to the thread
//! that created it, pumped explicitly by that thread.
//!
//! # Ordering
//!
//! - Tasks submitted with [`MainExecutor::run_async`] run in submission order.
//! - A delayed task joins the tail of the ready queue once its deadline
//!   passes. Immediate tasks submitted after it may therefore run first.
//! - Delayed tasks with equal deadlines run in submission order.
//!
//! # Failure Modes
//!
//! - **Pumping off the main thread**: every pump method returns
//!   [`ContextError::OffMainContext`] instead of running anything.
//! - **Panicking task**: the panic propagates out of the pump call. Tasks
//!   still queued stay queued and run on the next pump.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Unit of work executed on the main context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Errors from main-context operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The operation is only valid on the main context.
    OffMainContext { operation: &'static str },
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OffMainContext { operation } => {
                write!(f, "cannot invoke {operation} off the main context")
            }
        }
    }
}

impl std::error::Error for ContextError {}

/// Executes tasks on a single serialized main context.
pub trait MainExecutor: Send + Sync {
    /// Whether the calling thread is the main context.
    fn is_main_thread(&self) -> bool;

    /// Queue `task` to run on the main context.
    fn run_async(&self, task: Task);

    /// Queue `task` to run on the main context no earlier than `delay` from now.
    fn run_async_after(&self, task: Task, delay: Duration);

    /// Run `task` immediately. Only valid on the main context.
    fn run_now(&self, task: Task) -> Result<(), ContextError> {
        if !self.is_main_thread() {
            return Err(ContextError::OffMainContext {
                operation: "run_now",
            });
        }
        task();
        Ok(())
    }
}

/// Configuration for a [`MainContext`].
#[derive(Debug, Clone)]
pub struct MainContextConfig {
    /// Name used in diagnostics.
    pub name: String,
    /// Maximum tasks executed by one [`MainContext::run_pending`] call.
    pub max_tasks_per_turn: usize,
}

impl Default for MainContextConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            max_tasks_per_turn: 1024,
        }
    }
}

impl MainContextConfig {
    /// Set the diagnostic name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the per-turn task limit. Clamped to at least 1.
    #[must_use]
    pub fn with_max_tasks_per_turn(mut self, max: usize) -> Self {
        self.max_tasks_per_turn = max.max(1);
        self
    }
}

struct Delayed {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so that `BinaryHeap` pops the earliest deadline first.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Task>,
    delayed: BinaryHeap<Delayed>,
    next_seq: u64,
}

impl Queue {
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(delayed) = self.delayed.pop() {
                self.ready.push_back(delayed.task);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.due)
    }
}

struct Shared {
    thread: ThreadId,
    config: MainContextConfig,
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Pumpable main-context executor bound to the thread that created it.
///
/// Cloning yields another handle to the same queue; handles are `Send` and
/// `Sync` so producers can move them to other threads.
///
/// ```
/// use livebus_core::main_context::{MainContext, MainExecutor};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let main = MainContext::new();
/// let hits = Arc::new(AtomicUsize::new(0));
///
/// let remote = main.clone();
/// let h = Arc::clone(&hits);
/// std::thread::spawn(move || {
///     remote.run_async(Box::new(move || {
///         h.fetch_add(1, Ordering::SeqCst);
///     }));
/// })
/// .join()
/// .unwrap();
///
/// assert_eq!(main.run_pending().unwrap(), 1);
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone)]
pub struct MainContext {
    shared: Arc<Shared>,
}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainContext")
            .field("name", &self.shared.config.name)
            .field("thread", &self.shared.thread)
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContext {
    /// Bind a new main context to the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MainContextConfig::default())
    }

    /// Bind a new main context to the calling thread with `config`.
    #[must_use]
    pub fn with_config(config: MainContextConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                thread: thread::current().id(),
                config,
                queue: Mutex::new(Queue::default()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Configuration this context was created with.
    #[must_use]
    pub fn config(&self) -> &MainContextConfig {
        &self.shared.config
    }

    /// Number of queued tasks, ready or delayed.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        let queue = self.lock();
        queue.ready.len() + queue.delayed.len()
    }

    /// Run tasks that are ready now, including delayed tasks whose deadline
    /// passed. Tasks queued by running tasks are picked up in the same call.
    ///
    /// Returns the number of tasks executed, at most
    /// [`MainContextConfig::max_tasks_per_turn`].
    pub fn run_pending(&self) -> Result<usize, ContextError> {
        self.ensure_main("run_pending")?;
        let mut ran = 0;
        while ran < self.shared.config.max_tasks_per_turn {
            let Some(task) = self.next_ready() else {
                break;
            };
            task();
            ran += 1;
        }
        #[cfg(feature = "tracing")]
        if ran > 0 {
            tracing::trace!(context = %self.shared.config.name, ran, "main context turn");
        }
        Ok(ran)
    }

    /// Pump until no task is queued, sleeping until delayed tasks are due.
    pub fn run_until_idle(&self) -> Result<usize, ContextError> {
        self.ensure_main("run_until_idle")?;
        let mut ran = 0;
        loop {
            ran += self.run_pending()?;
            let mut queue = self.lock();
            queue.promote_due(Instant::now());
            if !queue.ready.is_empty() {
                continue;
            }
            let Some(due) = queue.next_deadline() else {
                return Ok(ran);
            };
            let wait = due.saturating_duration_since(Instant::now());
            drop(
                self.shared
                    .wake
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }

    /// Pump for `budget` of wall-clock time, sleeping while nothing is ready.
    pub fn run_for(&self, budget: Duration) -> Result<usize, ContextError> {
        self.ensure_main("run_for")?;
        let deadline = Instant::now() + budget;
        let mut ran = 0;
        loop {
            ran += self.run_pending()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(ran);
            }
            let mut queue = self.lock();
            queue.promote_due(now);
            if !queue.ready.is_empty() {
                continue;
            }
            let until = queue.next_deadline().map_or(deadline, |due| due.min(deadline));
            let wait = until.saturating_duration_since(now);
            drop(
                self.shared
                    .wake
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }

    fn ensure_main(&self, operation: &'static str) -> Result<(), ContextError> {
        if self.is_main_thread() {
            Ok(())
        } else {
            Err(ContextError::OffMainContext { operation })
        }
    }

    fn next_ready(&self) -> Option<Task> {
        let mut queue = self.lock();
        queue.promote_due(Instant::now());
        queue.ready.pop_front()
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        // Tasks never run under the lock, so a poisoned queue is still consistent.
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl MainExecutor for MainContext {
    fn is_main_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    fn run_async(&self, task: Task) {
        self.lock().ready.push_back(task);
        self.shared.wake.notify_all();
    }

    fn run_async_after(&self, task: Task, delay: Duration) {
        let due = Instant::now() + delay;
        {
            let mut queue = self.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.delayed.push(Delayed { due, seq, task });
        }
        self.shared.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |label: &'static str| -> Task {
            let log = Arc::clone(&log_clone);
            Box::new(move || log.lock().unwrap().push(label))
        };
        (log, make)
    }

    #[test]
    fn runs_in_submission_order() {
        let main = MainContext::new();
        let (log, task) = recorder();
        main.run_async(task("a"));
        main.run_async(task("b"));
        main.run_async(task("c"));

        assert_eq!(main.pending_tasks(), 3);
        assert_eq!(main.run_pending().unwrap(), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(main.pending_tasks(), 0);
    }

    #[test]
    fn tasks_queued_by_tasks_run_in_same_turn() {
        let main = MainContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_main = main.clone();
        let h = Arc::clone(&hits);
        main.run_async(Box::new(move || {
            let h2 = Arc::clone(&h);
            inner_main.run_async(Box::new(move || {
                h2.fetch_add(1, AtomicOrdering::SeqCst);
            }));
            h.fetch_add(1, AtomicOrdering::SeqCst);
        }));

        assert_eq!(main.run_pending().unwrap(), 2);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn turn_limit_is_respected() {
        let main = MainContext::with_config(MainContextConfig::default().with_max_tasks_per_turn(2));
        let (log, task) = recorder();
        main.run_async(task("a"));
        main.run_async(task("b"));
        main.run_async(task("c"));

        assert_eq!(main.run_pending().unwrap(), 2);
        assert_eq!(main.run_pending().unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn delayed_task_waits_for_deadline() {
        let main = MainContext::new();
        let (log, task) = recorder();
        main.run_async_after(task("late"), Duration::from_millis(30));
        main.run_async(task("now"));

        assert_eq!(main.run_pending().unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["now"]);

        main.run_until_idle().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["now", "late"]);
    }

    #[test]
    fn equal_deadlines_keep_submission_order() {
        let main = MainContext::new();
        let (log, task) = recorder();
        main.run_async_after(task("first"), Duration::ZERO);
        main.run_async_after(task("second"), Duration::ZERO);
        main.run_until_idle().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn run_for_respects_budget() {
        let main = MainContext::new();
        let (log, task) = recorder();
        main.run_async_after(task("far"), Duration::from_secs(60));
        main.run_async(task("near"));

        main.run_for(Duration::from_millis(10)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["near"]);
        assert_eq!(main.pending_tasks(), 1);
    }

    #[test]
    fn pumping_off_main_is_rejected() {
        let main = MainContext::new();
        let remote = main.clone();
        let result = thread::spawn(move || {
            assert!(!remote.is_main_thread());
            remote.run_pending()
        })
        .join()
        .unwrap();

        assert_eq!(
            result,
            Err(ContextError::OffMainContext {
                operation: "run_pending"
            })
        );
    }

    #[test]
    fn run_now_only_on_main() {
        let main = MainContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        main.run_now(Box::new(move || {
            h.fetch_add(1, AtomicOrdering::SeqCst);
        }))
        .unwrap();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);

        let remote = main.clone();
        let err = thread::spawn(move || remote.run_now(Box::new(|| {})))
            .join()
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("run_now"));
    }

    #[test]
    fn background_submission_wakes_idle_pump() {
        let main = MainContext::new();
        let (log, task) = recorder();
        main.run_async_after(task("timer"), Duration::from_millis(300));

        let remote = main.clone();
        let background = task("background");
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.run_async(background);
        });

        main.run_until_idle().unwrap();
        producer.join().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["background", "timer"]);
    }
}
