//! Errno-carrying cancellation token for hooked I/O
//!
//! A parked fiber and the deadline timer that may cancel it share one
//! token. Whoever fires first records the reason; the fiber inspects the
//! token after it is resumed and turns a non-zero value into `errno`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Shared cancellation state for one blocking-call attempt
///
/// The token starts clear. `cancel(errno)` is first-wins: a later call
/// with a different reason does not overwrite the recorded one. The
/// timer side holds only a `Weak` to the token, so a completed call
/// drops the state and the timer callback degrades to a no-op.
#[derive(Debug, Default)]
pub struct IoCancelToken {
    cancelled: AtomicI32,
}

impl IoCancelToken {
    /// Create a fresh, shareable token
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicI32::new(0),
        })
    }

    /// Record a cancellation reason (an errno value, e.g. `ETIMEDOUT`)
    ///
    /// Returns true if this call was the one that cancelled.
    #[inline]
    pub fn cancel(&self, errno: i32) -> bool {
        self.cancelled
            .compare_exchange(0, errno, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a reason has been recorded
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) != 0
    }

    /// The recorded errno, or 0 when not cancelled
    #[inline]
    pub fn reason(&self) -> i32 {
        self.cancelled.load(Ordering::Acquire)
    }
}
