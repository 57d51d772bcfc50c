//! Stackful cooperative fibers
//!
//! A fiber is an execution context with its own guard-paged stack and a
//! saved callee-saved register block. At most one fiber per OS thread is
//! in EXEC; the distinguished thread-root fiber owns no heap stack and
//! represents the thread itself.
//!
//! A suspended fiber publishes its next state only after its registers
//! are fully saved: `yield_to_*` records the intended state, and the
//! resumer commits it once the switch back has completed. Schedulers
//! skip fibers still observed in EXEC, so a timer or event firing in
//! the switch window cannot resume a half-saved context.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use weft_core::error::FiberError;
use weft_core::state::FiberState;
use weft_core::werror;

use crate::arch::{self, Context};
use crate::config::{self, ConfigVar};
use crate::stack::FiberStack;
use crate::tls;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Sentinel for "no pending yield state"
const NO_PENDING: u8 = 0xFF;

fn stack_size_config() -> &'static Arc<ConfigVar<u32>> {
    static VAR: OnceLock<Arc<ConfigVar<u32>>> = OnceLock::new();
    VAR.get_or_init(|| config::lookup::<u32>("fiber.stack_size", 128 * 1024, "fiber stack size"))
}

type EntryFn = Box<dyn FnOnce() + Send>;

/// A cooperative task with its own stack and saved machine context
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// State to commit once the registers are saved; see module docs
    pending_yield: AtomicU8,
    stack: Option<FiberStack>,
    ctx: UnsafeCell<Context>,
    entry: UnsafeCell<Option<EntryFn>>,
    /// Context of the resumer; valid only while this fiber is in EXEC
    link: UnsafeCell<*mut Context>,
    panic_msg: Mutex<Option<String>>,
}

// Safety: `ctx`, `entry` and `link` are only touched by the thread that
// currently resumes or executes the fiber. That thread is unique: a
// fiber enters EXEC under a single resumer, and schedulers never resume
// a fiber observed in EXEC. `state`/`pending_yield` are atomics.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Thread-root constructor: no stack, already executing
    pub(crate) fn new_root() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Exec as u8),
            pending_yield: AtomicU8::new(NO_PENDING),
            stack: None,
            ctx: UnsafeCell::new(Context::zeroed()),
            entry: UnsafeCell::new(None),
            link: UnsafeCell::new(std::ptr::null_mut()),
            panic_msg: Mutex::new(None),
        })
    }

    /// Create a fiber from an entry closure
    ///
    /// `stack_size` of 0 takes the `fiber.stack_size` config value. The
    /// first `resume()` enters the closure through the arch trampoline.
    pub fn new<F>(cb: F, stack_size: usize) -> Result<Arc<Fiber>, FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size != 0 {
            stack_size
        } else {
            stack_size_config().get() as usize
        };
        let stack = FiberStack::alloc(size)?;

        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Init as u8),
            pending_yield: AtomicU8::new(NO_PENDING),
            stack: Some(stack),
            ctx: UnsafeCell::new(Context::zeroed()),
            entry: UnsafeCell::new(Some(Box::new(cb))),
            link: UnsafeCell::new(std::ptr::null_mut()),
            panic_msg: Mutex::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        fiber.arm();
        Ok(fiber)
    }

    /// Point the saved context at the trampoline for a fresh run
    fn arm(&self) {
        let stack = self.stack.as_ref().expect("root fibers are never armed");
        unsafe {
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_entry,
                self as *const Fiber as usize,
            );
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Whether this is a thread-root fiber
    #[inline]
    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    /// Message of the panic that moved this fiber to EXCEPT, if any
    pub fn panic_message(&self) -> Option<String> {
        self.panic_msg.lock().clone()
    }

    /// Number of live fibers in the process (roots included)
    pub fn total() -> usize {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// Fiber currently executing on this thread
    pub fn current() -> Option<Arc<Fiber>> {
        tls::current()
    }

    /// Id of the executing fiber, 0 when the thread has none
    pub fn current_id() -> u64 {
        tls::current_fiber_id()
    }

    /// Switch the calling context into this fiber
    ///
    /// The caller acts as the dispatcher: when the fiber yields or
    /// finishes, control returns here. Fails for EXEC, TERM and EXCEPT.
    pub fn resume(self: &Arc<Fiber>) -> Result<(), FiberError> {
        let state = self.state();
        if !state.is_resumable() {
            return Err(FiberError::BadState {
                op: "resume",
                state,
            });
        }

        let prev = tls::ensure_current();
        debug_assert!(!Arc::ptr_eq(&prev, self));

        self.set_state(FiberState::Exec);
        unsafe {
            *self.link.get() = prev.ctx.get();
        }
        tls::set_current(self.clone());

        unsafe {
            arch::switch_context(prev.ctx.get(), self.ctx.get());
        }

        // The fiber suspended (or finished); we are the thread again.
        tls::set_current(prev);
        let pending = self.pending_yield.swap(NO_PENDING, Ordering::AcqRel);
        if pending != NO_PENDING {
            self.set_state(FiberState::from(pending));
        }
        Ok(())
    }

    /// Suspend the current fiber as HOLD; resumable only by an event,
    /// timer or explicit re-schedule
    pub fn yield_to_hold() -> Result<(), FiberError> {
        Self::yield_with(FiberState::Hold)
    }

    /// Suspend the current fiber as READY; the scheduler re-queues it
    pub fn yield_to_ready() -> Result<(), FiberError> {
        Self::yield_with(FiberState::Ready)
    }

    fn yield_with(state: FiberState) -> Result<(), FiberError> {
        let cur = tls::current().ok_or(FiberError::NotInFiber)?;
        if cur.is_root() {
            return Err(FiberError::NotInFiber);
        }

        // Publish the target state only after the switch has saved our
        // registers: the resumer commits it (see resume()).
        cur.pending_yield.store(state as u8, Ordering::Release);
        let link = unsafe { *cur.link.get() };
        debug_assert!(!link.is_null());
        unsafe {
            arch::switch_context(cur.ctx.get(), link);
        }
        Ok(())
    }

    /// Rebind a finished (or never-started) fiber to a new closure
    ///
    /// The stack is reused. Only legal in TERM or INIT.
    pub fn reset<F>(&self, cb: F) -> Result<(), FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_root() {
            return Err(FiberError::BadState {
                op: "reset",
                state: self.state(),
            });
        }
        let state = self.state();
        if !state.is_resettable() {
            return Err(FiberError::BadState { op: "reset", state });
        }

        unsafe {
            *self.entry.get() = Some(Box::new(cb));
        }
        *self.panic_msg.lock() = None;
        self.pending_yield.store(NO_PENDING, Ordering::Release);
        self.arm();
        self.set_state(FiberState::Init);
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if self.stack.is_some() {
            // READY-but-never-resumed fibers go quietly at shutdown;
            // EXEC or HOLD here means a live context is being torn down.
            if state == FiberState::Exec || state == FiberState::Hold {
                werror!("fiber {} dropped in state {}", self.id, state);
                debug_assert!(false, "fiber dropped while live");
            }
        } else {
            debug_assert_eq!(state, FiberState::Exec);
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("root", &self.is_root())
            .finish()
    }
}

/// Trampoline target: runs the entry closure, records the outcome and
/// switches back to the resumer. Never returns.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };

    let entry = unsafe { (*fiber.entry.get()).take() };
    let outcome = catch_unwind(AssertUnwindSafe(move || {
        if let Some(cb) = entry {
            cb();
        }
    }));

    match outcome {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "non-string panic payload".to_string()
            };
            werror!("fiber {} panicked: {}", fiber.id, msg);
            *fiber.panic_msg.lock() = Some(msg);
            fiber.set_state(FiberState::Except);
        }
    }

    let link = unsafe { *fiber.link.get() };
    unsafe {
        arch::switch_context(fiber.ctx.get(), link);
    }
    unreachable!("finished fiber resumed");
}
