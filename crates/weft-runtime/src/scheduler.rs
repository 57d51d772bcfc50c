//! N:M fiber scheduler
//!
//! Maps fibers onto a fixed pool of worker threads. Each worker runs a
//! single-threaded dispatch loop: pop the first runnable queue entry
//! whose preferred thread matches, resume it, re-queue on READY, drop on
//! HOLD/TERM/EXCEPT, and fall back to the idle fiber when the queue has
//! nothing for this worker.
//!
//! With `use_caller` the constructing thread becomes a worker too: the
//! scheduler builds a dedicated root fiber running the same loop, and
//! `stop()` resumes it on the caller thread to drain remaining work.
//!
//! The overridable parts (`tickle`/`stopping`/`idle`) form the
//! [`Driver`] trait; the IO manager installs itself as the driver.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use weft_core::error::{FiberError, SchedError};
use weft_core::state::FiberState;
use weft_core::{werror, winfo, wwarn};

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::thread::{current_thread_id, Thread};

thread_local! {
    /// Scheduler owning the calling worker thread
    static SCHEDULER: RefCell<Option<Arc<SchedCore>>> = const { RefCell::new(None) };

    /// Worker index on this thread (usize::MAX when not a worker)
    static WORKER_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Worker index of the calling thread, if it belongs to a scheduler
pub(crate) fn current_worker_index() -> Option<usize> {
    let idx = WORKER_INDEX.with(|c| c.get());
    (idx != usize::MAX).then_some(idx)
}

/// Overridable scheduler capabilities
///
/// The base scheduler's tickle is a no-op and its idle fiber merely
/// yields until stopping; the IO manager supplies a self-pipe tickle and
/// an epoll-wait idle loop.
pub trait Driver: Send + Sync {
    /// Wake one idle worker
    fn tickle(&self);

    /// Full stop condition (replaces the base condition)
    fn stopping(&self) -> bool;

    /// Body of the per-worker idle fiber; returns when stopping
    fn idle(&self);
}

/// One runnable queue entry: a fiber or a closure, optionally pinned
pub struct Task {
    pub(crate) kind: TaskKind,
    pub(crate) thread: Option<usize>,
}

pub(crate) enum TaskKind {
    Fiber(Arc<Fiber>),
    Func(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Run an existing fiber on any worker
    pub fn fiber(f: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(f),
            thread: None,
        }
    }

    /// Run an existing fiber, pinned to one worker index
    pub fn fiber_pinned(f: Arc<Fiber>, thread: usize) -> Task {
        Task {
            kind: TaskKind::Fiber(f),
            thread: Some(thread),
        }
    }

    /// Run a closure (wrapped into a fiber at dispatch time)
    pub fn func<F>(cb: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Func(Box::new(cb)),
            thread: None,
        }
    }

    /// Run a closure, pinned to one worker index
    pub fn func_pinned<F>(cb: F, thread: usize) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Func(Box::new(cb)),
            thread: Some(thread),
        }
    }
}

pub(crate) struct SchedCore {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    /// Worker threads spawned by start() (excludes the caller worker)
    spawn_count: usize,
    use_caller: bool,
    caller_thread: u64,
    started: AtomicBool,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    threads: Mutex<Vec<Thread>>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    driver: OnceLock<Weak<dyn Driver>>,
    io: OnceLock<Weak<IoManager>>,
}

impl SchedCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::Acquire) > 0
    }

    pub(crate) fn set_driver(&self, d: Weak<dyn Driver>) {
        let _ = self.driver.set(d);
    }

    pub(crate) fn set_io(&self, io: Weak<IoManager>) {
        let _ = self.io.set(io);
    }

    pub(crate) fn io(&self) -> Option<Arc<IoManager>> {
        self.io.get().and_then(|w| w.upgrade())
    }

    fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver.get().and_then(|w| w.upgrade())
    }

    fn tickle_hook(&self) {
        if let Some(d) = self.driver() {
            d.tickle();
        }
    }

    /// Base stop condition; drivers AND their own conditions onto it
    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
    }

    fn check_stopping(&self) -> bool {
        match self.driver() {
            Some(d) => d.stopping(),
            None => self.base_stopping(),
        }
    }

    /// Internal enqueue used by event triggers and timer drains, which
    /// must keep working while a stop drains existing work
    pub(crate) fn submit_unchecked(&self, task: Task) {
        let was_empty = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if was_empty {
            self.tickle_hook();
        }
    }

    pub(crate) fn submit_batch_unchecked<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let was_empty = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.extend(tasks);
            was_empty && !q.is_empty()
        };
        if was_empty {
            self.tickle_hook();
        }
    }

    fn submit(&self, task: Task) -> Result<(), SchedError> {
        if self.stopping.load(Ordering::Acquire) {
            werror!("scheduler {} rejects work while stopping", self.name);
            return Err(SchedError::Stopped);
        }
        self.submit_unchecked(task);
        Ok(())
    }

    /// Entry of the per-worker idle fiber
    fn idle_entry(&self) {
        match self.driver() {
            Some(d) => d.idle(),
            None => {
                // Base idle: nothing to wait on; bounce back to the
                // worker loop until the stop condition holds.
                while !self.check_stopping() {
                    if Fiber::yield_to_hold().is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Handle to a scheduler; clones share the same core
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedCore>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers
    ///
    /// With `use_caller` the constructing thread counts as one worker
    /// (index `threads - 1`); the remaining `threads - 1` are spawned by
    /// `start()` and the caller's share runs inside `stop()`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Scheduler, SchedError> {
        assert!(threads >= 1, "scheduler needs at least one worker");
        let spawn_count = if use_caller { threads - 1 } else { threads };

        let core = Arc::new(SchedCore {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            spawn_count,
            use_caller,
            caller_thread: current_thread_id(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(None),
            driver: OnceLock::new(),
            io: OnceLock::new(),
        });

        if use_caller {
            // The caller's worker loop lives in its own root fiber,
            // separate from the thread-root, so the caller's code can
            // interleave with scheduled work.
            let caller_index = spawn_count;
            let weak = Arc::downgrade(&core);
            let root = Fiber::new(
                move || {
                    if let Some(core) = weak.upgrade() {
                        run(core, caller_index);
                    }
                },
                0,
            )?;
            *core.root_fiber.lock() = Some(root);

            SCHEDULER.with(|s| *s.borrow_mut() = Some(core.clone()));
            WORKER_INDEX.with(|c| c.set(caller_index));
        }

        Ok(Scheduler { core })
    }

    /// Scheduler owning the calling thread, if any
    pub fn current() -> Option<Scheduler> {
        SCHEDULER.with(|s| s.borrow().clone()).map(|core| Scheduler { core })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Total workers, the caller worker included
    pub fn worker_count(&self) -> usize {
        self.core.spawn_count + usize::from(self.core.use_caller)
    }

    pub fn is_stopping(&self) -> bool {
        self.core.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn core(&self) -> &Arc<SchedCore> {
        &self.core
    }

    /// Spawn the worker threads; idempotent
    pub fn start(&self) {
        if self.core.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.core.stopping.load(Ordering::Acquire) {
            return;
        }
        winfo!(
            "scheduler {} starting {} worker thread(s)",
            self.core.name,
            self.core.spawn_count
        );
        let mut threads = self.core.threads.lock();
        for i in 0..self.core.spawn_count {
            let core = self.core.clone();
            let name = format!("{}_{}", self.core.name, i);
            match Thread::spawn(&name, move || run(core, i)) {
                Ok(t) => threads.push(t),
                Err(e) => werror!("scheduler {} worker spawn failed: {}", self.core.name, e),
            }
        }
    }

    /// Queue a closure on any worker
    pub fn schedule<F>(&self, cb: F) -> Result<(), SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.submit(Task::func(cb))
    }

    /// Queue a closure pinned to one worker index
    pub fn schedule_pinned<F>(&self, thread: usize, cb: F) -> Result<(), SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.submit(Task::func_pinned(cb, thread))
    }

    /// Queue an existing fiber
    pub fn schedule_fiber(
        &self,
        fiber: Arc<Fiber>,
        thread: Option<usize>,
    ) -> Result<(), SchedError> {
        self.core.submit(Task {
            kind: TaskKind::Fiber(fiber),
            thread,
        })
    }

    /// Queue a batch, waking at most one worker for the whole batch
    pub fn schedule_batch<I>(&self, tasks: I) -> Result<(), SchedError>
    where
        I: IntoIterator<Item = Task>,
    {
        if self.core.stopping.load(Ordering::Acquire) {
            werror!("scheduler {} rejects work while stopping", self.core.name);
            return Err(SchedError::Stopped);
        }
        self.core.submit_batch_unchecked(tasks);
        Ok(())
    }

    /// Re-queue a fiber owned by the runtime (timers, event triggers)
    pub(crate) fn schedule_resumed(&self, fiber: Arc<Fiber>) {
        self.core.submit_unchecked(Task::fiber(fiber));
    }

    /// Mark auto-stop, wake every worker and drain
    ///
    /// With `use_caller`, the caller thread runs its worker share here;
    /// spawned workers are joined before returning.
    pub fn stop(&self) {
        let core = &self.core;
        core.auto_stop.store(true, Ordering::Release);

        let root = core.root_fiber.lock().clone();
        if let Some(rf) = &root {
            if core.spawn_count == 0 && rf.state().is_resettable() {
                winfo!("scheduler {} stopped", core.name);
                core.stopping.store(true, Ordering::Release);
                if core.check_stopping() {
                    return;
                }
            }
        }

        core.stopping.store(true, Ordering::Release);
        for _ in 0..core.spawn_count {
            core.tickle_hook();
        }
        if root.is_some() {
            core.tickle_hook();
        }

        if let Some(rf) = root {
            if !core.check_stopping() && rf.state().is_resumable() {
                if current_thread_id() == core.caller_thread {
                    if let Err(e) = rf.resume() {
                        werror!("scheduler {} root fiber resume failed: {}", core.name, e);
                    }
                } else {
                    wwarn!(
                        "scheduler {} stop() off the caller thread; caller share not drained",
                        core.name
                    );
                }
            }
        }

        let threads: Vec<Thread> = std::mem::take(&mut *core.threads.lock());
        for t in threads {
            t.join();
        }

        // The caller thread is a worker no longer; clear its bindings
        // so later registrations on this thread do not route here.
        if core.use_caller && current_thread_id() == core.caller_thread {
            SCHEDULER.with(|s| {
                let mut slot = s.borrow_mut();
                if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, core)) {
                    *slot = None;
                }
            });
            WORKER_INDEX.with(|c| c.set(usize::MAX));
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.core.name)
            .field("workers", &self.worker_count())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// Per-worker dispatch loop
fn run(core: Arc<SchedCore>, index: usize) {
    SCHEDULER.with(|s| *s.borrow_mut() = Some(core.clone()));
    WORKER_INDEX.with(|c| c.set(index));
    crate::hook::set_hook_enable(true);

    let idle_core = core.clone();
    let idle_fiber = match Fiber::new(move || idle_core.idle_entry(), 0) {
        Ok(f) => f,
        Err(e) => {
            werror!("scheduler {} worker {}: idle fiber: {}", core.name, index, e);
            return;
        }
    };

    // Reused fiber for closure tasks; replaced when one parks itself
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut need_tickle = false;
        let mut task: Option<Task> = None;
        {
            let mut q = core.queue.lock();
            let mut i = 0;
            while i < q.len() {
                if let Some(t) = q[i].thread {
                    if t != index {
                        // Pinned elsewhere; make sure its worker wakes
                        need_tickle = true;
                        i += 1;
                        continue;
                    }
                }
                if let TaskKind::Fiber(f) = &q[i].kind {
                    // Mid-switch on another worker: its resumer has not
                    // committed the yield yet. Leave it queued and keep
                    // a wake-up coming so the retry is prompt.
                    if f.state() == FiberState::Exec {
                        need_tickle = true;
                        i += 1;
                        continue;
                    }
                }
                task = q.remove(i);
                break;
            }
            if task.is_some() {
                core.active_threads.fetch_add(1, Ordering::AcqRel);
                need_tickle |= !q.is_empty();
            }
        }
        if need_tickle {
            core.tickle_hook();
        }

        match task {
            Some(Task {
                kind: TaskKind::Fiber(fiber),
                ..
            }) => {
                dispatch_fiber(&core, &fiber);
                core.active_threads.fetch_sub(1, Ordering::AcqRel);
            }
            Some(Task {
                kind: TaskKind::Func(cb),
                ..
            }) => {
                let fiber = match cb_fiber.take() {
                    Some(f) if f.state().is_resettable() => match f.reset(cb) {
                        Ok(()) => f,
                        Err(e) => {
                            werror!("scheduler {}: cb fiber reset: {}", core.name, e);
                            core.active_threads.fetch_sub(1, Ordering::AcqRel);
                            continue;
                        }
                    },
                    _ => match Fiber::new(cb, 0) {
                        Ok(f) => f,
                        Err(e) => {
                            werror!("scheduler {}: cb fiber alloc: {}", core.name, e);
                            core.active_threads.fetch_sub(1, Ordering::AcqRel);
                            continue;
                        }
                    },
                };
                dispatch_fiber(&core, &fiber);
                if fiber.state().is_finished() || fiber.state() == FiberState::Init {
                    // Keep the stack for the next closure
                    cb_fiber = Some(fiber);
                }
                core.active_threads.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    winfo!("scheduler {} worker {} exiting", core.name, index);
                    crate::hook::set_hook_enable(false);
                    break;
                }
                core.idle_threads.fetch_add(1, Ordering::AcqRel);
                if let Err(e) = idle_fiber.resume() {
                    werror!("scheduler {} idle resume: {}", core.name, e);
                }
                core.idle_threads.fetch_sub(1, Ordering::AcqRel);
                std::thread::yield_now();
            }
        }
    }
}

/// Resume one fiber and route it by the state it comes back in
fn dispatch_fiber(core: &Arc<SchedCore>, fiber: &Arc<Fiber>) {
    if !fiber.state().is_resumable() {
        return;
    }
    match fiber.resume() {
        Ok(()) => {
            if fiber.state() == FiberState::Ready {
                core.submit_unchecked(Task::fiber(fiber.clone()));
            }
            // HOLD: parked in an event slot or timer; TERM/EXCEPT: done
        }
        Err(FiberError::BadState { .. }) => {
            // Raced with another worker that took it first; harmless
        }
        Err(e) => werror!("scheduler {}: resume failed: {}", core.name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_spawned_workers_run_closures() {
        let sched = Scheduler::new(2, false, "t_run").unwrap();
        sched.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = counter.clone();
            sched
                .schedule(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "t_caller").unwrap();
        sched.start(); // spawns nothing; caller is the only worker

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            sched
                .schedule(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_schedule_after_stop_rejected() {
        weft_core::trace::set_log_level(weft_core::trace::LogLevel::Off);
        let sched = Scheduler::new(1, false, "t_stopped").unwrap();
        sched.start();
        sched.stop();
        assert!(matches!(sched.schedule(|| {}), Err(SchedError::Stopped)));
    }

    #[test]
    fn test_fifo_on_single_worker() {
        let sched = Scheduler::new(1, false, "t_fifo").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let o = order.clone();
            sched
                .schedule(move || {
                    o.lock().push(i);
                })
                .unwrap();
        }
        sched.start();
        sched.stop();
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_yield_to_ready_requeues() {
        let sched = Scheduler::new(1, false, "t_ready").unwrap();
        sched.start();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        sched
            .schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready().unwrap();
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pinned_task_runs_on_its_worker() {
        let sched = Scheduler::new(3, false, "t_pin").unwrap();
        sched.start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..12 {
            let s = seen.clone();
            sched
                .schedule_pinned(1, move || {
                    s.lock().push(current_worker_index().unwrap());
                })
                .unwrap();
        }
        sched.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 12);
        assert!(seen.iter().all(|&w| w == 1));
    }

    #[test]
    fn test_scheduler_current_inside_task() {
        let sched = Scheduler::new(1, false, "t_current").unwrap();
        sched.start();

        let name = Arc::new(Mutex::new(String::new()));
        let n = name.clone();
        sched
            .schedule(move || {
                if let Some(s) = Scheduler::current() {
                    *n.lock() = s.name().to_string();
                }
            })
            .unwrap();
        sched.stop();
        assert_eq!(*name.lock(), "t_current");
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        weft_core::trace::set_log_level(weft_core::trace::LogLevel::Off);
        let sched = Scheduler::new(1, false, "t_panic").unwrap();
        sched.start();

        let counter = Arc::new(AtomicUsize::new(0));
        sched.schedule(|| panic!("task panic")).unwrap();
        let c = counter.clone();
        sched
            .schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_many_tasks_many_workers() {
        let sched = Scheduler::new(4, false, "t_many").unwrap();
        sched.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10_000 {
            let c = counter.clone();
            sched
                .schedule(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 10_000);
    }

    #[test]
    fn test_schedule_existing_fiber() {
        let sched = Scheduler::new(1, false, "t_fiber").unwrap();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();
        sched.schedule_fiber(fiber, None).unwrap();
        sched.start();
        sched.stop();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hold_fiber_resumed_by_external_schedule() {
        let sched = Scheduler::new(1, false, "t_hold").unwrap();
        sched.start();

        let stage = Arc::new(AtomicUsize::new(0));
        let s = stage.clone();
        let fiber = Fiber::new(
            move || {
                s.store(1, Ordering::SeqCst);
                Fiber::yield_to_hold().unwrap();
                s.store(2, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();

        sched.schedule_fiber(fiber.clone(), None).unwrap();
        while stage.load(Ordering::SeqCst) != 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        // Give the worker a moment to commit HOLD, then wake it again
        while fiber.state() != FiberState::Hold {
            std::thread::sleep(Duration::from_millis(1));
        }
        sched.schedule_fiber(fiber, None).unwrap();
        sched.stop();
        assert_eq!(stage.load(Ordering::SeqCst), 2);
    }
}
