//! Thread-local fiber registry
//!
//! Every OS thread tracks which fiber is executing on it and owns a
//! distinguished thread-root fiber that embodies the thread itself.
//! Both are updated only at context-switch boundaries.

use std::cell::RefCell;
use std::sync::Arc;

use crate::fiber::Fiber;

thread_local! {
    /// Fiber currently in EXEC on this thread
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's root fiber (no heap stack; represents the thread)
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Fiber currently executing on this thread, if any
#[inline]
pub fn current() -> Option<Arc<Fiber>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Install the executing fiber (called around context switches)
#[inline]
pub(crate) fn set_current(f: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(f));
}

/// This thread's root fiber, if one was ever created
#[inline]
pub fn thread_root() -> Option<Arc<Fiber>> {
    THREAD_ROOT.with(|c| c.borrow().clone())
}

/// Current fiber, creating and installing the thread-root on first use
///
/// A thread that has never touched fibers gets its root fiber here; the
/// root is born in EXEC and becomes the current fiber.
pub(crate) fn ensure_current() -> Arc<Fiber> {
    if let Some(f) = current() {
        return f;
    }
    let root = Fiber::new_root();
    THREAD_ROOT.with(|c| *c.borrow_mut() = Some(root.clone()));
    CURRENT.with(|c| *c.borrow_mut() = Some(root.clone()));
    root
}

/// Id of the executing fiber, 0 when the thread has none
#[inline]
pub fn current_fiber_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map_or(0, |f| f.id()))
}
