//! Error types for the weft runtime

use core::fmt;

use crate::state::FiberState;

/// Errors from fiber stack allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed (carries errno)
    AllocFailed(i32),

    /// mprotect on the guard page failed (carries errno)
    GuardFailed(i32),

    /// Requested size is below the minimum usable stack
    TooSmall(usize),
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocFailed(e) => write!(f, "stack mmap failed: errno {}", e),
            StackError::GuardFailed(e) => write!(f, "stack guard mprotect failed: errno {}", e),
            StackError::TooSmall(n) => write!(f, "stack size {} below minimum", n),
        }
    }
}

impl std::error::Error for StackError {}

/// Errors from fiber construction and state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// Operation not legal in the fiber's current state
    BadState {
        /// Operation attempted
        op: &'static str,
        /// State the fiber was observed in
        state: FiberState,
    },

    /// Stack could not be allocated
    Stack(StackError),

    /// Operation requires a current non-root fiber on this thread
    NotInFiber,
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::BadState { op, state } => {
                write!(f, "fiber {} illegal in state {}", op, state)
            }
            FiberError::Stack(e) => write!(f, "fiber stack: {}", e),
            FiberError::NotInFiber => write!(f, "no current fiber on this thread"),
        }
    }
}

impl std::error::Error for FiberError {}

impl From<StackError> for FiberError {
    fn from(e: StackError) -> Self {
        FiberError::Stack(e)
    }
}

/// Errors from scheduler operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// schedule() after stop() was initiated
    Stopped,

    /// Fiber could not be created for a queued closure
    Fiber(FiberError),

    /// No scheduler installed on the calling thread
    NoScheduler,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Stopped => write!(f, "scheduler is stopping"),
            SchedError::Fiber(e) => write!(f, "scheduler fiber: {}", e),
            SchedError::NoScheduler => write!(f, "no scheduler on this thread"),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<FiberError> for SchedError {
    fn from(e: FiberError) -> Self {
        SchedError::Fiber(e)
    }
}

/// Errors from descriptor event registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    /// The (fd, event) pair is already registered — caller contract violation
    AlreadyRegistered,

    /// The (fd, event) pair is not registered
    NotRegistered,

    /// epoll_ctl rejected the operation (carries errno)
    EpollCtl(i32),

    /// The descriptor is closed or invalid
    BadFd,

    /// Registration without a callback requires a current fiber
    NoCurrentFiber,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::AlreadyRegistered => write!(f, "event already registered"),
            EventError::NotRegistered => write!(f, "event not registered"),
            EventError::EpollCtl(e) => write!(f, "epoll_ctl failed: errno {}", e),
            EventError::BadFd => write!(f, "bad file descriptor"),
            EventError::NoCurrentFiber => write!(f, "no current fiber to register"),
        }
    }
}

impl std::error::Error for EventError {}
