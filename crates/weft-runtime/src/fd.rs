//! Per-descriptor bookkeeping
//!
//! A process-wide registry of descriptor contexts, filled in lazily the
//! first time the hook layer touches an fd. Sockets are forced to
//! kernel-level non-blocking; the user's own non-blocking choice is
//! tracked separately so `fcntl`/`ioctl` can keep lying consistently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libc::c_int;
use parking_lot::RwLock;

/// Which per-operation deadline an I/O direction consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Receive-class calls; set via `SO_RCVTIMEO`
    Recv,
    /// Send-class calls; set via `SO_SNDTIMEO`
    Send,
}

impl TimeoutKind {
    /// Map a `setsockopt` option name, if it is one of the two timeouts
    pub fn from_sockopt(optname: c_int) -> Option<TimeoutKind> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

/// Context of one descriptor
pub struct FdCtx {
    fd: c_int,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    /// Milliseconds; `u64::MAX` means no deadline
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    /// Inspect the descriptor and, for sockets, force kernel non-blocking
    fn new(fd: c_int) -> FdCtx {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        let is_socket = unsafe {
            libc::fstat(fd, stat.as_mut_ptr()) == 0
                && (stat.assume_init().st_mode & libc::S_IFMT) == libc::S_IFSOCK
        };

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(u64::MAX),
            send_timeout_ms: AtomicU64::new(u64::MAX),
        }
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Kernel-level non-blocking, set by the runtime for sockets
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// Non-blocking as requested by user code via fcntl/ioctl
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// Deadline for one direction; `u64::MAX` when unset
    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide descriptor registry, indexed by fd
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            fds: RwLock::new(Vec::with_capacity(64)),
        }
    }

    /// Fetch the context of `fd`, creating it when `auto_create`
    pub fn get(&self, fd: c_int, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let fds = self.fds.read();
            if let Some(Some(ctx)) = fds.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let mut fds = self.fds.write();
        if idx >= fds.len() {
            fds.resize(idx + idx / 2 + 1, None);
        }
        if let Some(ctx) = &fds[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        fds[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget `fd`; later lookups start from a fresh context
    pub fn del(&self, fd: c_int) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write();
        if let Some(slot) = fds.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}

/// The process-wide registry
pub fn fd_manager() -> &'static FdManager {
    static INSTANCE: OnceLock<FdManager> = OnceLock::new();
    INSTANCE.get_or_init(FdManager::new)
}
