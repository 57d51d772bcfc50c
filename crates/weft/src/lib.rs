//! # weft - cooperative fibers for blocking-style network code
//!
//! A user-space cooperative scheduler that makes ordinary blocking-style
//! I/O run efficiently on a fixed thread pool: stackful fibers mapped
//! N:M onto worker threads, an epoll IO manager with per-descriptor
//! event slots, hierarchical deadline timers, and a hook layer that
//! turns blocking syscalls into yield + event + timer sequences.
//!
//! ## Quick Start
//!
//! ```no_run
//! use weft::{hook, IoManager};
//!
//! fn main() -> std::io::Result<()> {
//!     // 2 worker threads; the caller stays free
//!     let iom = IoManager::new(2, false, "main")?;
//!
//!     iom.schedule(|| {
//!         // Looks blocking; parks the fiber, not the thread.
//!         hook::sleep(1);
//!         println!("one second later, cooperatively");
//!     }).unwrap();
//!
//!     iom.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        User Code                            │
//! │        schedule(), hook::read/recv/connect/sleep            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       IoManager                             │
//! │   epoll + self-pipe + timers, per-fd READ/WRITE slots       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Scheduler                             │
//! │     runnable queue of fibers/closures, worker threads       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │   Fiber   │
//!    │  Thread   │      │  Thread   │      │  Stacks   │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

// Re-export core types
pub use weft_core::cancel::IoCancelToken;
pub use weft_core::error::{EventError, FiberError, SchedError, StackError};
pub use weft_core::state::FiberState;

// Re-export logging macros and controls
pub use weft_core::trace::{self, LogLevel};
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};

// Re-export the runtime surface
pub use weft_runtime::config::{lookup as config_lookup, ConfigVar};
pub use weft_runtime::fd::{fd_manager, FdCtx, FdManager, TimeoutKind};
pub use weft_runtime::fiber::Fiber;
pub use weft_runtime::hook;
pub use weft_runtime::iomanager::{IoEvent, IoManager};
pub use weft_runtime::scheduler::{Scheduler, Task};
pub use weft_runtime::thread::{current_thread_id, current_thread_name, Thread};
pub use weft_runtime::time::current_ms;
pub use weft_runtime::timer::{Timer, TimerManager};
