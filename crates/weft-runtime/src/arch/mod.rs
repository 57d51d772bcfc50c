//! Architecture-specific context switching
//!
//! Each architecture module exports the same surface:
//!
//! - `Context` - the callee-saved register block of a suspended fiber
//! - `init_context` - arm a fresh context so the first switch enters the
//!   trampoline, which calls `entry(arg)`
//! - `switch_context` - save into `old`, restore from `new`
//!
//! A switch is synchronous within the OS thread; the saved registers
//! stay valid until the context is switched back into.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("Unsupported architecture");
    }
}
