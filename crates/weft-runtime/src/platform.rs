//! Thin Linux platform helpers shared across the runtime

/// Current thread's errno value
#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Set the current thread's errno value
#[inline]
pub(crate) fn set_errno(v: i32) {
    unsafe {
        *libc::__errno_location() = v;
    }
}

/// System page size in bytes
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Kernel thread id of the calling thread
#[inline]
pub(crate) fn gettid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}
