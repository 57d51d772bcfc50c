//! Epoll-driven IO manager
//!
//! Specialises the scheduler with a readiness multiplexer, a wake-up
//! self-pipe and an embedded timer set. For every descriptor two event
//! slots (READ, WRITE) record which scheduler to post to and which
//! fiber or closure to run when readiness arrives.
//!
//! Events are edge-triggered and single-shot: firing a slot unregisters
//! it, and code wanting repeated readiness re-registers after handling.
//!
//! The per-worker idle fiber blocks in `epoll_wait` for at most the
//! nearest timer deadline (capped at 3 s), drains due timers into the
//! runnable queue, fires ready slots and yields back to the worker loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use libc::c_int;
use parking_lot::{Mutex, RwLock};
use weft_core::error::{EventError, SchedError};
use weft_core::state::FiberState;
use weft_core::{werror, winfo};

use crate::fiber::Fiber;
use crate::platform::errno;
use crate::scheduler::{Driver, Scheduler, Task, TaskKind};
use crate::timer::{Timer, TimerManager, TimerNotify};
use crate::tls;

/// Longest epoll wait when no timer is nearer, in milliseconds
const MAX_TIMEOUT_MS: u64 = 3000;

/// Ready-event batch collected per idle-loop turn
const MAX_EVENTS: usize = 256;

/// A descriptor readiness direction
///
/// Values coincide with `EPOLLIN`/`EPOLLOUT` so masks can be handed to
/// the multiplexer directly.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read = 0x001,
    Write = 0x004,
}

impl IoEvent {
    #[inline]
    fn mask(self) -> u32 {
        self as u32
    }
}

const EVENT_MASK: u32 = IoEvent::Read as u32 | IoEvent::Write as u32;

/// What runs when one direction fires, and where
#[derive(Default)]
struct EventSlot {
    scheduler: Option<Scheduler>,
    task: Option<TaskKind>,
}

#[derive(Default)]
struct IoFdInner {
    /// Registered directions; invariant: a set bit has a populated slot
    events: u32,
    read: EventSlot,
    write: EventSlot,
}

impl IoFdInner {
    fn slot_mut(&mut self, event: IoEvent) -> &mut EventSlot {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }
}

/// Per-descriptor event registry entry
struct IoFdCtx {
    fd: c_int,
    inner: Mutex<IoFdInner>,
}

/// Scheduler specialisation with epoll, self-pipe and timers
pub struct IoManager {
    sched: Scheduler,
    timers: TimerManager,
    epfd: c_int,
    tickle_fds: [c_int; 2],
    /// Count of registered (fd, event) pairs awaiting readiness
    pending: AtomicUsize,
    fd_ctxs: RwLock<Vec<Option<Arc<IoFdCtx>>>>,
}

impl IoManager {
    /// Build the manager and start its workers
    ///
    /// The embedded scheduler starts immediately; call [`stop`] to wind
    /// it down (`stop` also runs from `Drop` as a backstop).
    ///
    /// [`stop`]: IoManager::stop
    pub fn new(threads: usize, use_caller: bool, name: &str) -> std::io::Result<Arc<IoManager>> {
        let sched = Scheduler::new(threads, use_caller, name).map_err(std::io::Error::other)?;

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut pipe = [0 as c_int; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            let e = std::io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
            }
            return Err(e);
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe[0], &mut ev) } != 0 {
            let e = std::io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(pipe[0]);
                libc::close(pipe[1]);
            }
            return Err(e);
        }

        let iom = Arc::new(IoManager {
            sched: sched.clone(),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe,
            pending: AtomicUsize::new(0),
            fd_ctxs: RwLock::new(Vec::new()),
        });
        iom.timers
            .set_notify(Arc::downgrade(&iom) as Weak<dyn TimerNotify>);
        sched.core().set_driver(Arc::downgrade(&iom) as Weak<dyn Driver>);
        sched.core().set_io(Arc::downgrade(&iom));
        sched.start();
        Ok(iom)
    }

    /// IO manager owning the calling worker thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current().and_then(|s| s.core().io())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Registered (fd, event) pairs not yet fired
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue a closure on the embedded scheduler
    pub fn schedule<F>(&self, cb: F) -> Result<(), SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule(cb)
    }

    /// Queue an existing fiber on the embedded scheduler
    pub fn schedule_fiber(
        &self,
        fiber: Arc<Fiber>,
        thread: Option<usize>,
    ) -> Result<(), SchedError> {
        self.sched.schedule_fiber(fiber, thread)
    }

    /// Stop the embedded scheduler and drain
    pub fn stop(&self) {
        self.sched.stop();
    }

    /// Add a timer due in `ms` milliseconds
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Add a weak-witness-guarded timer (see [`TimerManager`])
    pub fn add_condition_timer<F, W>(
        &self,
        ms: u64,
        cb: F,
        witness: Weak<W>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        W: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, witness, recurring)
    }

    /// Milliseconds until the earliest timer (`u64::MAX` when none)
    pub fn next_timer_ms(&self) -> u64 {
        self.timers.next_timer_ms()
    }

    /// Register a readiness direction; the current fiber is the action
    ///
    /// The fiber is resumed once when the direction fires (or the event
    /// is cancelled). Re-registering an already-registered (fd, event)
    /// pair is a caller contract violation and fails.
    pub fn add_event(&self, fd: c_int, event: IoEvent) -> Result<(), EventError> {
        self.add_event_inner(fd, event, None)
    }

    /// Register a readiness direction with an explicit closure action
    pub fn add_event_cb<F>(&self, fd: c_int, event: IoEvent, cb: F) -> Result<(), EventError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, Some(Box::new(cb)))
    }

    fn add_event_inner(
        &self,
        fd: c_int,
        event: IoEvent,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), EventError> {
        if fd < 0 {
            return Err(EventError::BadFd);
        }
        let ctx = self.ensure_fd_ctx(fd);
        let mut inner = ctx.inner.lock();

        if inner.events & event.mask() != 0 {
            werror!(
                "iomanager {}: add_event({}, {:?}) already registered, mask={:#x}",
                self.sched.name(),
                fd,
                event,
                inner.events
            );
            return Err(EventError::AlreadyRegistered);
        }

        let task = match cb {
            Some(cb) => TaskKind::Func(cb),
            None => {
                let cur = tls::current()
                    .filter(|f| !f.is_root())
                    .ok_or(EventError::NoCurrentFiber)?;
                debug_assert_eq!(cur.state(), FiberState::Exec);
                TaskKind::Fiber(cur)
            }
        };

        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | inner.events | event.mask(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let e = errno();
            werror!(
                "iomanager {}: epoll_ctl(op={}, fd={}) failed: errno {}",
                self.sched.name(),
                op,
                fd,
                e
            );
            return Err(EventError::EpollCtl(e));
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        inner.events |= event.mask();
        let slot = inner.slot_mut(event);
        slot.scheduler = Scheduler::current().or_else(|| Some(self.sched.clone()));
        slot.task = Some(task);
        Ok(())
    }

    /// Unregister a direction without firing its slot
    pub fn del_event(&self, fd: c_int, event: IoEvent) -> bool {
        let Some(ctx) = self.fd_ctx(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events & event.mask() == 0 {
            return false;
        }

        let left = inner.events & !event.mask();
        if !self.update_epoll(fd, left) {
            return false;
        }
        inner.events = left;
        let slot = inner.slot_mut(event);
        slot.scheduler = None;
        slot.task = None;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Unregister a direction and fire its slot exactly once
    pub fn cancel_event(&self, fd: c_int, event: IoEvent) -> bool {
        let Some(ctx) = self.fd_ctx(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events & event.mask() == 0 {
            return false;
        }

        let left = inner.events & !event.mask();
        if !self.update_epoll(fd, left) {
            return false;
        }
        self.trigger(&mut inner, event);
        true
    }

    /// Fire and unregister both directions of a descriptor
    pub fn cancel_all(&self, fd: c_int) -> bool {
        let Some(ctx) = self.fd_ctx(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events == 0 {
            return false;
        }

        if !self.update_epoll(fd, 0) {
            return false;
        }
        if inner.events & IoEvent::Read.mask() != 0 {
            self.trigger(&mut inner, IoEvent::Read);
        }
        if inner.events & IoEvent::Write.mask() != 0 {
            self.trigger(&mut inner, IoEvent::Write);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }

    /// Existing registry entry for `fd`
    fn fd_ctx(&self, fd: c_int) -> Option<Arc<IoFdCtx>> {
        if fd < 0 {
            return None;
        }
        self.fd_ctxs.read().get(fd as usize).cloned().flatten()
    }

    /// Registry entry for `fd`, growing the table on demand
    fn ensure_fd_ctx(&self, fd: c_int) -> Arc<IoFdCtx> {
        let idx = fd as usize;
        if let Some(ctx) = self.fd_ctx(fd) {
            return ctx;
        }
        let mut table = self.fd_ctxs.write();
        if idx >= table.len() {
            let grown = (idx + idx / 2 + 1).max(32);
            table.resize(grown, None);
        }
        table[idx]
            .get_or_insert_with(|| {
                Arc::new(IoFdCtx {
                    fd,
                    inner: Mutex::new(IoFdInner::default()),
                })
            })
            .clone()
    }

    /// Re-arm the multiplexer with the remaining mask (removing on empty)
    fn update_epoll(&self, fd: c_int, left: u32) -> bool {
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            werror!(
                "iomanager {}: epoll_ctl(op={}, fd={}) failed: errno {}",
                self.sched.name(),
                op,
                fd,
                errno()
            );
            return false;
        }
        true
    }

    /// Consume one slot: clear the bit, post the action, drop the intent
    fn trigger(&self, inner: &mut IoFdInner, event: IoEvent) {
        debug_assert_ne!(inner.events & event.mask(), 0);
        inner.events &= !event.mask();
        let slot = inner.slot_mut(event);
        let sched = slot.scheduler.take();
        if let Some(task) = slot.task.take() {
            let sched = sched.unwrap_or_else(|| self.sched.clone());
            sched.core().submit_unchecked(Task {
                kind: task,
                thread: None,
            });
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drain every byte queued on the tickle pipe
    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Unconditional self-pipe write, used while winding down
    fn tickle_raw(&self) {
        let byte = [b'T'];
        let _ = unsafe {
            libc::write(
                self.tickle_fds[1],
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
    }
}

impl Driver for IoManager {
    fn tickle(&self) {
        // Nobody is parked in epoll_wait; a byte would only go stale
        if !self.sched.core().has_idle_threads() {
            return;
        }
        self.tickle_raw();
    }

    fn stopping(&self) -> bool {
        self.timers.next_timer_ms() == u64::MAX
            && self.pending.load(Ordering::Acquire) == 0
            && self.sched.core().base_stopping()
    }

    fn idle(&self) {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if Driver::stopping(self) {
                winfo!("iomanager {} idle exiting", self.sched.name());
                // Pass the wake-up on so blocked siblings exit promptly
                self.tickle_raw();
                break;
            }

            let timeout = self.timers.next_timer_ms().min(MAX_TIMEOUT_MS) as c_int;
            let ready = loop {
                let n = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as c_int,
                        timeout,
                    )
                };
                if n < 0 {
                    if errno() == libc::EINTR {
                        continue;
                    }
                    werror!(
                        "iomanager {}: epoll_wait failed: errno {}",
                        self.sched.name(),
                        errno()
                    );
                    break 0;
                }
                break n as usize;
            };

            let cbs = self.timers.drain_expired();
            if !cbs.is_empty() {
                self.sched
                    .core()
                    .submit_batch_unchecked(cbs.into_iter().map(|cb| Task::func(move || cb())));
            }

            for ev in events.iter().take(ready) {
                let ev = *ev;
                let fd = ev.u64 as c_int;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle_pipe();
                    continue;
                }

                let Some(ctx) = self.fd_ctx(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock();

                let mut revents = ev.events;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Errors wake whichever directions are registered
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events;
                }
                let real = revents & inner.events & EVENT_MASK;
                if real == 0 {
                    continue;
                }

                let left = inner.events & !real;
                if !self.update_epoll(fd, left) {
                    continue;
                }
                if real & IoEvent::Read.mask() != 0 {
                    self.trigger(&mut inner, IoEvent::Read);
                }
                if real & IoEvent::Write.mask() != 0 {
                    self.trigger(&mut inner, IoEvent::Write);
                }
            }

            // Let the worker loop run whatever was just queued
            if Fiber::yield_to_hold().is_err() {
                break;
            }
        }
    }
}

impl TimerNotify for IoManager {
    fn on_earliest_changed(&self) {
        Driver::tickle(self);
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
        debug_assert_eq!(self.pending.load(Ordering::Acquire), 0);
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
