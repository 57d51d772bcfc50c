//! Millisecond wall clock
//!
//! The timer subsystem works in absolute milliseconds from this clock.
//! It is the system wall clock on purpose: the rollover detection in
//! `TimerManager` exists precisely because this clock may jump backwards.

/// Current wall-clock time in milliseconds
#[inline]
pub fn current_ms() -> u64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe {
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
    }
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}
