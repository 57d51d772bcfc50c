//! # weft-core
//!
//! Core types for the weft fiber scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Everything that touches syscalls, stacks or registers lives in
//! `weft-runtime`.
//!
//! ## Modules
//!
//! - `state` - Fiber lifecycle state enum
//! - `error` - Error types for stacks, fibers, scheduling and events
//! - `cancel` - Errno-carrying cancellation token shared between a
//!   parked fiber and its deadline timer
//! - `trace` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod cancel;
pub mod env;
pub mod error;
pub mod state;
pub mod trace;

// Re-exports for convenience
pub use cancel::IoCancelToken;
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{EventError, FiberError, SchedError, StackError};
pub use state::FiberState;
