//! Leveled stderr logging for the runtime
//!
//! Thread-safe, optionally-flushing diagnostics in the spirit of printk.
//! The runtime itself logs sparingly: lifecycle transitions, idle-loop
//! anomalies and hook-layer failures.
//!
//! # Environment Variables
//!
//! - `WEFT_LOG_LEVEL=<level>` - off/error/warn/info/debug/trace or 0..5
//! - `WEFT_LOG_FLUSH=1` - flush stderr after every record

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, lowest to most verbose
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment variables
///
/// Called lazily on first use; call explicitly for deterministic setup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("WEFT_LOG_FLUSH") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("WEFT_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Whether records at `level` are emitted
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Internal: leveled write with a locked stderr handle
#[doc(hidden)]
pub fn _wlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level record
#[macro_export]
macro_rules! werror {
    ($($arg:tt)*) => {{
        $crate::trace::_wlog_impl(
            $crate::trace::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level record
#[macro_export]
macro_rules! wwarn {
    ($($arg:tt)*) => {{
        $crate::trace::_wlog_impl(
            $crate::trace::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level record
#[macro_export]
macro_rules! winfo {
    ($($arg:tt)*) => {{
        $crate::trace::_wlog_impl(
            $crate::trace::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level record
#[macro_export]
macro_rules! wdebug {
    ($($arg:tt)*) => {{
        $crate::trace::_wlog_impl(
            $crate::trace::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level record (most verbose)
#[macro_export]
macro_rules! wtrace {
    ($($arg:tt)*) => {{
        $crate::trace::_wlog_impl(
            $crate::trace::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}
