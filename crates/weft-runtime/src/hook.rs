//! Blocking-syscall interception
//!
//! POSIX-shaped wrappers that keep blocking semantics for the caller
//! while never blocking the worker thread. A call that would block
//! (EAGAIN on a runtime-nonblocking socket) registers a readiness event
//! plus an optional deadline timer sharing an [`IoCancelToken`], parks
//! the fiber, and retries once resumed. Results and `errno` match the
//! plain blocking calls.
//!
//! Hooks are per-thread (`set_hook_enable`), enabled by scheduler
//! workers on entry; when disabled every wrapper is a thin pass-through.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{c_int, c_uint, c_ulong, c_void, socklen_t};
use weft_core::cancel::IoCancelToken;
use weft_core::werror;
use weft_core::winfo;

use crate::config::{self, ConfigVar};
use crate::fd::{fd_manager, TimeoutKind};
use crate::fiber::Fiber;
use crate::iomanager::{IoEvent, IoManager};
use crate::platform::{errno, set_errno};
use crate::tls;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooks are active on the calling thread
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Turn hooks on or off for the calling thread
#[inline]
pub fn set_hook_enable(enable: bool) {
    HOOK_ENABLED.with(|c| c.set(enable));
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(u64::MAX);

fn connect_timeout_var() -> &'static Arc<ConfigVar<u64>> {
    static VAR: OnceLock<Arc<ConfigVar<u64>>> = OnceLock::new();
    VAR.get_or_init(|| {
        let var = config::lookup::<u64>("tcp.connect.timeout", 5000, "tcp connect timeout");
        CONNECT_TIMEOUT_MS.store(var.get(), Ordering::Release);
        var.add_listener(|old, new| {
            winfo!("tcp connect timeout changed from {} to {}", old, new);
            CONNECT_TIMEOUT_MS.store(*new, Ordering::Release);
        });
        var
    })
}

/// Default timeout applied by [`connect`], in milliseconds
pub fn connect_timeout_ms() -> u64 {
    connect_timeout_var();
    CONNECT_TIMEOUT_MS.load(Ordering::Acquire)
}

/// Change the default connect timeout (updates the config registry)
pub fn set_connect_timeout_ms(ms: u64) {
    connect_timeout_var().set(ms);
}

/// The common template shared by every read/write-class hook
///
/// `f` performs the raw call. EINTR retries in place; EAGAIN turns into
/// a conditional deadline timer plus an event registration plus a HOLD,
/// then retries once resumed unless the shared token was cancelled.
fn do_io<F>(fd: c_int, name: &str, event: IoEvent, kind: TimeoutKind, mut f: F) -> isize
where
    F: FnMut() -> isize,
{
    if !hook_enabled() {
        return f();
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return f();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return f();
    }

    let timeout_ms = ctx.timeout_ms(kind);
    let token = IoCancelToken::new();

    loop {
        let mut n = f();
        while n == -1 && errno() == libc::EINTR {
            n = f();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block: park this fiber until readiness or deadline
        let Some(iom) = IoManager::current() else {
            return n;
        };

        let timer = if timeout_ms != u64::MAX {
            let witness = Arc::downgrade(&token);
            let cancel_token = Arc::downgrade(&token);
            let iom_weak = Arc::downgrade(&iom);
            Some(iom.add_condition_timer(
                timeout_ms,
                move || {
                    let Some(t) = cancel_token.upgrade() else {
                        return;
                    };
                    if !t.cancel(libc::ETIMEDOUT) {
                        return;
                    }
                    if let Some(iom) = iom_weak.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                witness,
                false,
            ))
        } else {
            None
        };

        match iom.add_event(fd, event) {
            Err(e) => {
                werror!("{} add_event({}, {:?}) failed: {}", name, fd, event, e);
                if let Some(t) = timer {
                    t.cancel();
                }
                return -1;
            }
            Ok(()) => {
                let _ = Fiber::yield_to_hold();
                if let Some(t) = &timer {
                    t.cancel();
                }
                let reason = token.reason();
                if reason != 0 {
                    set_errno(reason);
                    return -1;
                }
                // Readiness arrived; take it from the top
            }
        }
    }
}

/// Park the current fiber for `ms` via a one-shot timer
///
/// Returns false when the calling context cannot be parked (hooks off,
/// no fiber, or no IO manager); callers fall through to the real call.
fn sleep_hooked(ms: u64) -> bool {
    if !hook_enabled() {
        return false;
    }
    let Some(fiber) = tls::current().filter(|f| !f.is_root()) else {
        return false;
    };
    let Some(iom) = IoManager::current() else {
        return false;
    };

    let sched = iom.scheduler().clone();
    iom.add_timer(
        ms,
        move || {
            sched.schedule_resumed(fiber.clone());
        },
        false,
    );
    Fiber::yield_to_hold().is_ok()
}

/// Hooked `sleep(3)`: the fiber parks, the worker keeps running
pub fn sleep(seconds: c_uint) -> c_uint {
    if sleep_hooked(seconds as u64 * 1000) {
        return 0;
    }
    unsafe { libc::sleep(seconds) }
}

/// Hooked `usleep(3)` (millisecond granularity once parked)
pub fn usleep(usec: c_uint) -> c_int {
    if sleep_hooked(usec as u64 / 1000) {
        return 0;
    }
    unsafe { libc::usleep(usec) }
}

/// Hooked `nanosleep(2)` (millisecond granularity once parked)
pub fn nanosleep(req: &libc::timespec) -> c_int {
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    if sleep_hooked(ms) {
        return 0;
    }
    unsafe { libc::nanosleep(req, std::ptr::null_mut()) }
}

/// Hooked `socket(2)`: registers the descriptor with the fd manager
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        return fd;
    }
    fd_manager().get(fd, true);
    fd
}

/// Hooked `connect(2)` with an explicit timeout in milliseconds
///
/// `u64::MAX` means wait for the kernel. After EINPROGRESS the fiber
/// parks on WRITE readiness; the result is read back from `SO_ERROR`.
pub fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };
    let token = IoCancelToken::new();

    let timer = if timeout_ms != u64::MAX {
        let witness = Arc::downgrade(&token);
        let cancel_token = Arc::downgrade(&token);
        let iom_weak = Arc::downgrade(&iom);
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(t) = cancel_token.upgrade() else {
                    return;
                };
                if !t.cancel(libc::ETIMEDOUT) {
                    return;
                }
                if let Some(iom) = iom_weak.upgrade() {
                    iom.cancel_event(fd, IoEvent::Write);
                }
            },
            witness,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, IoEvent::Write) {
        Ok(()) => {
            let _ = Fiber::yield_to_hold();
            if let Some(t) = &timer {
                t.cancel();
            }
            let reason = token.reason();
            if reason != 0 {
                set_errno(reason);
                return -1;
            }
        }
        Err(e) => {
            // Registration failed while the connect is still in flight;
            // SO_ERROR would read 0 here and fake a success.
            if let Some(t) = &timer {
                t.cancel();
            }
            werror!("connect add_event({}, WRITE) failed: {}", fd, e);
            return -1;
        }
    }

    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Hooked `connect(2)` using the configured default timeout
pub fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, connect_timeout_ms())
}

/// Hooked `accept(2)`: the accepted descriptor joins the fd manager
pub fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let n = do_io(fd, "accept", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if n >= 0 {
        fd_manager().get(n as c_int, true);
    }
    n as c_int
}

/// Hooked `read(2)`
pub fn read(fd: c_int, buf: &mut [u8]) -> isize {
    do_io(fd, "read", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) as isize
    })
}

/// Hooked `readv(2)`
pub fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "readv", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov, iovcnt) as isize
    })
}

/// Hooked `recv(2)`
pub fn recv(fd: c_int, buf: &mut [u8], flags: c_int) -> isize {
    do_io(fd, "recv", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) as isize
    })
}

/// Hooked `recvfrom(2)`
pub fn recvfrom(
    fd: c_int,
    buf: &mut [u8],
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    do_io(fd, "recvfrom", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags,
            src_addr,
            addrlen,
        ) as isize
    })
}

/// Hooked `recvmsg(2)`
pub fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "recvmsg", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags) as isize
    })
}

/// Hooked `write(2)`
pub fn write(fd: c_int, buf: &[u8]) -> isize {
    do_io(fd, "write", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) as isize
    })
}

/// Hooked `writev(2)`
pub fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "writev", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov, iovcnt) as isize
    })
}

/// Hooked `send(2)`
pub fn send(fd: c_int, buf: &[u8], flags: c_int) -> isize {
    do_io(fd, "send", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) as isize
    })
}

/// Hooked `sendto(2)`
pub fn sendto(
    fd: c_int,
    buf: &[u8],
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> isize {
    do_io(fd, "sendto", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags,
            to,
            tolen,
        ) as isize
    })
}

/// Hooked `sendmsg(2)`
pub fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "sendmsg", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags) as isize
    })
}

/// Hooked `close(2)`: cancels registered events, forgets the fd context
pub fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if fd_manager().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl(2)` for integer-argument commands
///
/// `F_SETFL` records the user's O_NONBLOCK choice and keeps the kernel
/// flag set for sockets; `F_GETFL` reports the flags as the user last
/// shaped them. Other commands pass `arg` through unchanged.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::fcntl(fd, cmd, arg) };
    }
    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = fd_manager().get(fd, false) else {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            }
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let arg = if ctx.sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            let Some(ctx) = fd_manager().get(fd, false) else {
                return flags;
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return flags;
            }
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Hooked `ioctl(2)`: FIONBIO records the user's non-blocking choice
pub fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::ioctl(fd, request, arg) };
    }
    if request == libc::FIONBIO {
        let user_nonblock = unsafe { *(arg as *mut c_int) } != 0;
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { libc::ioctl(fd, request, arg) }
}

/// Hooked `getsockopt(2)` (pure pass-through)
pub fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// Hooked `setsockopt(2)`: captures SO_RCVTIMEO/SO_SNDTIMEO as the
/// per-operation deadlines, then performs the real call
pub fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::setsockopt(fd, level, optname, optval, optlen) };
    }
    if level == libc::SOL_SOCKET {
        if let Some(kind) = TimeoutKind::from_sockopt(optname) {
            if optlen as usize >= std::mem::size_of::<libc::timeval>() {
                if let Some(ctx) = fd_manager().get(fd, false) {
                    let tv = unsafe { &*(optval as *const libc::timeval) };
                    let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
                    ctx.set_timeout_ms(kind, ms);
                }
            }
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_flag_is_per_thread() {
        set_hook_enable(false);
        assert!(!hook_enabled());
        set_hook_enable(true);
        assert!(hook_enabled());

        let handle = std::thread::spawn(|| hook_enabled());
        assert!(!handle.join().unwrap());

        set_hook_enable(false);
        assert!(!hook_enabled());
    }

    #[test]
    fn test_connect_timeout_config_roundtrip() {
        let initial = connect_timeout_ms();
        assert!(initial > 0);

        set_connect_timeout_ms(750);
        assert_eq!(connect_timeout_ms(), 750);
        set_connect_timeout_ms(initial);
        assert_eq!(connect_timeout_ms(), initial);
    }

    #[test]
    fn test_disabled_hooks_pass_through() {
        set_hook_enable(false);
        // read on an invalid fd goes straight to the kernel
        let mut buf = [0u8; 4];
        let n = read(-1, &mut buf);
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EBADF);
    }

    #[test]
    fn test_setsockopt_records_deadline() {
        set_hook_enable(true);
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd_manager().get(fd, true);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 250_000,
        };
        let rc = setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const c_void,
            std::mem::size_of::<libc::timeval>() as socklen_t,
        );
        assert_eq!(rc, 0);

        let ctx = fd_manager().get(fd, false).unwrap();
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), u64::MAX);

        fd_manager().del(fd);
        unsafe {
            libc::close(fd);
        }
        set_hook_enable(false);
    }

    #[test]
    fn test_fcntl_lies_about_nonblock() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // The user never asked for O_NONBLOCK: hide the runtime's flag
        let flags = fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        let kernel = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(kernel & libc::O_NONBLOCK, 0);

        // The user opts in: report it, keep the kernel flag set
        let rc = fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        assert_eq!(rc, 0);
        let flags = fcntl(fd, libc::F_GETFL, 0);
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        let ctx = fd_manager().get(fd, false).unwrap();
        assert!(ctx.user_nonblock());

        // And back out again
        let rc = fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
        assert_eq!(rc, 0);
        assert!(!ctx.user_nonblock());
        let kernel = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(kernel & libc::O_NONBLOCK, 0);

        close(fd);
        set_hook_enable(false);
    }

    #[test]
    fn test_ioctl_fionbio_records_choice() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let mut on: c_int = 1;
        let rc = ioctl(fd, libc::FIONBIO, &mut on as *mut c_int as *mut c_void);
        assert_eq!(rc, 0);
        let ctx = fd_manager().get(fd, false).unwrap();
        assert!(ctx.user_nonblock());

        close(fd);
        set_hook_enable(false);
    }

    #[test]
    fn test_close_forgets_context() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        assert!(fd_manager().get(fd, false).is_some());

        assert_eq!(close(fd), 0);
        assert!(fd_manager().get(fd, false).is_none());
        set_hook_enable(false);
    }
}
