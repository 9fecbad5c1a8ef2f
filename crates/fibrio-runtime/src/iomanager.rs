//! epoll-backed IOManager
//!
//! A `Scheduler` whose idle workers block in `epoll_wait` instead of
//! spinning. Fibers (or callbacks) register interest in READ/WRITE on an
//! fd; when the kernel reports readiness the waiter is handed back to the
//! scheduler it registered from. Registrations are edge-triggered and
//! one-shot: a fired event is removed from the interest set.
//!
//! Workers are woken early through a self-pipe (`tickle`) when new tasks
//! arrive or a timer becomes the earliest deadline.
//!
//! ```text
//!   add_event(fd, READ) --> epoll_ctl(ADD|MOD, EPOLLET|events)
//!                                    |
//!   idle(): epoll_wait(timeout = min(next_timer, 3000ms))
//!           +-- expired timers --> schedule_batch
//!           +-- tickle pipe    --> drain
//!           +-- fd ready       --> epoll_ctl(MOD|DEL), schedule waiter
//!           +-- yield_to_hold
//! ```

use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use fibrio_core::constants::NO_TIMEOUT;
use fibrio_core::error::{SchedError, SchedResult};
use fibrio_core::{kassert, kdebug, kerror, kfatal, kinfo, kwarn, FiberState};
use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};

use crate::config::{defaults, SchedulerConfig};
use crate::fiber::{Fiber, FiberFn};
use crate::scheduler::{self, Scheduler, SchedulerBase, Task};
use crate::timer::{Timer, TimerManager};
use crate::tls;

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

/// Readiness kinds a waiter can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Event {
    None = 0,
    Read = EPOLLIN,
    Write = EPOLLOUT,
}

impl Event {
    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Who is waiting on one direction of an fd
#[derive(Default)]
struct EventContext {
    scheduler: Option<Weak<dyn Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }
}

#[derive(Default)]
struct FdState {
    /// Registered interest, a mask of `Event` bits
    events: u32,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn context_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
            Event::None => kfatal!("no event context for Event::None"),
        }
    }

    /// Clear `event` from the interest set and take its waiter
    fn take(&mut self, event: Event) -> Waiter {
        kassert!(
            self.events & event.bits() != 0,
            "trigger of unregistered event {:?} (events={:#x})",
            event,
            self.events
        );
        self.events &= !event.bits();
        let ctx = std::mem::take(self.context_mut(event));
        let task = match (ctx.cb, ctx.fiber) {
            (Some(cb), _) => Some(Task::boxed(cb)),
            (None, Some(fiber)) => Some(Task::fiber(fiber)),
            (None, None) => None,
        };
        Waiter {
            scheduler: ctx.scheduler,
            task,
        }
    }
}

/// A waiter taken out of an fd, scheduled once the fd lock is released
struct Waiter {
    scheduler: Option<Weak<dyn Scheduler>>,
    task: Option<Task>,
}

impl Waiter {
    fn dispatch(self, fd: RawFd) {
        let Some(task) = self.task else {
            return;
        };
        match self.scheduler.and_then(|w| w.upgrade()) {
            Some(sched) => sched.schedule(task),
            None => kwarn!(target: "system", "fd {} waiter dropped, its scheduler is gone", fd),
        }
    }
}

/// Per-fd registration record
pub struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Registered interest mask
    pub fn events(&self) -> u32 {
        self.state.lock().events
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL",
        _ => "EPOLL_CTL_?",
    }
}

/// Scheduler with an epoll reactor and a timer set
pub struct IoManager {
    base: SchedulerBase,
    epfd: OwnedFd,
    tickle_rx: OwnedFd,
    tickle_tx: OwnedFd,
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    timers: TimerManager,
    this: Weak<IoManager>,
}

impl IoManager {
    /// Create and start an IOManager.
    ///
    /// With `use_caller`, the calling thread is one of the `threads` and
    /// runs its share of the work inside `stop()`.
    ///
    /// Workers hold their own strong reference, so dropping the returned
    /// `Arc` does not shut them down: call `stop()`, or own the IOManager
    /// through `fibrio::Runtime`, which stops it on drop.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SchedError::last_os("epoll_create1"));
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(SchedError::last_os("pipe2"));
        }
        let tickle_rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let tickle_tx = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let mut ev = libc::epoll_event {
            events: EPOLLIN | EPOLLET,
            u64: tickle_rx.as_raw_fd() as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(
                epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                tickle_rx.as_raw_fd(),
                &mut ev,
            )
        };
        if rc != 0 {
            return Err(SchedError::Poller {
                op: "EPOLL_CTL_ADD",
                fd: tickle_rx.as_raw_fd(),
                errno: Errno::last_raw(),
            });
        }

        let mut contexts = Vec::new();
        Self::grow(&mut contexts, defaults::INITIAL_FD_CONTEXTS);

        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let this: Weak<dyn Scheduler> = weak.clone();
            let notify = weak.clone();
            IoManager {
                base: SchedulerBase::new(threads, use_caller, name, this),
                epfd,
                tickle_rx,
                tickle_tx,
                pending: AtomicUsize::new(0),
                contexts: RwLock::new(contexts),
                timers: TimerManager::with_front_notifier(move || {
                    if let Some(iom) = notify.upgrade() {
                        iom.tickle();
                    }
                }),
                this: weak.clone(),
            }
        });

        iom.start()?;
        Ok(iom)
    }

    pub fn from_config(config: &SchedulerConfig) -> SchedResult<Arc<IoManager>> {
        config.validate()?;
        Self::new(config.threads, config.use_caller, &config.name)
    }

    /// IOManager driving the calling thread, if any
    pub fn this() -> Option<Arc<IoManager>> {
        scheduler::this()?.as_io_manager()
    }

    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        let sched: Arc<dyn Scheduler> = self.clone();
        scheduler::start(&sched)
    }

    /// Stop once every queued task, pending event and timer is done
    pub fn stop(self: &Arc<Self>) {
        let sched: Arc<dyn Scheduler> = self.clone();
        scheduler::stop(&sched);
    }

    fn grow(contexts: &mut Vec<Arc<FdContext>>, size: usize) {
        while contexts.len() < size {
            let fd = contexts.len() as RawFd;
            contexts.push(Arc::new(FdContext::new(fd)));
        }
    }

    fn context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().get(fd as usize).cloned()
    }

    fn context_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        kassert!(fd >= 0, "negative fd {}", fd);
        if let Some(ctx) = self.context(fd) {
            return ctx;
        }
        let idx = fd as usize;
        let mut contexts = self.contexts.write();
        Self::grow(&mut contexts, (idx * 3 / 2).max(idx + 1));
        contexts[idx].clone()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> SchedResult<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc == 0 {
            return Ok(());
        }
        let errno = Errno::last_raw();
        kerror!(
            target: "system",
            "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
            self.epfd.as_raw_fd(),
            op_name(op),
            fd,
            events,
            Errno::from_raw(errno)
        );
        Err(SchedError::Poller {
            op: op_name(op),
            fd,
            errno,
        })
    }

    /// Register interest in `event` on `fd`.
    ///
    /// With `cb`, the callback is scheduled when the event fires; otherwise
    /// the current fiber is, and it is expected to `yield_to_hold` next.
    /// Registering an event that is already registered is fatal.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> SchedResult<()> {
        let ctx = self.context_or_grow(fd);
        let mut state = ctx.state.lock();
        if state.events & event.bits() != 0 {
            kfatal!(
                "add_event fd={} event={:?} already registered (events={:#x})",
                fd,
                event,
                state.events
            );
        }

        let op = if state.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, EPOLLET | state.events | event.bits())?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.events |= event.bits();

        let scheduler = match tls::current_scheduler() {
            Some(sched) => Arc::downgrade(&sched),
            None => self.this.clone() as Weak<dyn Scheduler>,
        };
        let ectx = state.context_mut(event);
        kassert!(ectx.is_empty(), "fd {} {:?} context not empty", fd, event);
        ectx.scheduler = Some(scheduler);
        match cb {
            Some(cb) => ectx.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                kassert!(
                    fiber.state() == FiberState::Exec,
                    "add_event from fiber {} in {}",
                    fiber.id(),
                    fiber.state()
                );
                ectx.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Remove `event` from `fd` without waking its waiter
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events & event.bits() == 0 {
            return false;
        }

        let left = state.events & !event.bits();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if self.ctl(op, fd, EPOLLET | left).is_err() {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);
        state.events = left;
        *state.context_mut(event) = EventContext::default();
        true
    }

    /// Remove `event` from `fd` and wake its waiter as if it fired
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd) else {
            return false;
        };
        let waiter = {
            let mut state = ctx.state.lock();
            if state.events & event.bits() == 0 {
                return false;
            }

            let left = state.events & !event.bits();
            let op = if left != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_DEL
            };
            if self.ctl(op, fd, EPOLLET | left).is_err() {
                return false;
            }

            self.pending.fetch_sub(1, Ordering::AcqRel);
            state.take(event)
        };
        waiter.dispatch(fd);
        true
    }

    /// Deregister `fd` and wake every waiter on it
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context(fd) else {
            return false;
        };
        let mut waiters = Vec::with_capacity(2);
        {
            let mut state = ctx.state.lock();
            if state.events == 0 {
                return false;
            }
            if self.ctl(libc::EPOLL_CTL_DEL, fd, 0).is_err() {
                return false;
            }

            for event in [Event::Read, Event::Write] {
                if state.events & event.bits() != 0 {
                    waiters.push(state.take(event));
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
            kassert!(state.events == 0, "fd {} still has events after cancel_all", fd);
        }
        for waiter in waiters {
            waiter.dispatch(fd);
        }
        true
    }

    /// Events registered and not yet fired or removed
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, W>(&self, ms: u64, cb: F, cond: Weak<W>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        W: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn next_timer(&self) -> u64 {
        self.timers.next_timer()
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    fn stopping_with(&self, next_timeout: u64) -> bool {
        next_timeout == NO_TIMEOUT
            && self.pending.load(Ordering::Acquire) == 0
            && self.base.base_stopping()
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_rx.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Dispatch one epoll result for a registered fd
    fn handle_ready(&self, fd: RawFd, mut revents: u32) {
        let Some(ctx) = self.context(fd) else {
            return;
        };
        let mut waiters = Vec::with_capacity(2);
        {
            let mut state = ctx.state.lock();
            if revents & (EPOLLERR | EPOLLHUP) != 0 {
                revents |= (EPOLLIN | EPOLLOUT) & state.events;
            }
            let mut real = 0;
            if revents & EPOLLIN != 0 {
                real |= Event::Read.bits();
            }
            if revents & EPOLLOUT != 0 {
                real |= Event::Write.bits();
            }
            if state.events & real == 0 {
                return;
            }

            let left = state.events & !real;
            let op = if left != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_DEL
            };
            if self.ctl(op, fd, EPOLLET | left).is_err() {
                return;
            }

            for event in [Event::Read, Event::Write] {
                if real & event.bits() != 0 && state.events & event.bits() != 0 {
                    waiters.push(state.take(event));
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        for waiter in waiters {
            waiter.dispatch(fd);
        }
    }
}

impl Scheduler for IoManager {
    fn base(&self) -> &SchedulerBase {
        &self.base
    }

    fn tickle(&self) {
        if !self.has_idle_threads() {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_tx.as_raw_fd(), b"T".as_ptr().cast(), 1) };
        if rc != 1 {
            let errno = Errno::last();
            if errno != Errno::EAGAIN {
                kerror!(target: "system", "{} tickle write failed: {}", self.base.name(), errno);
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stopping_with(self.timers.next_timer())
    }

    fn idle(&self) {
        kdebug!(target: "system", "{} idle", self.base.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; defaults::MAX_EVENTS];
        let tickle_fd = self.tickle_rx.as_raw_fd();

        loop {
            let next = self.timers.next_timer();
            if self.stopping_with(next) {
                kinfo!(target: "system", "{} idle stopping exit", self.base.name());
                self.tickle();
                break;
            }

            let timeout = next.min(defaults::POLL_MAX_TIMEOUT_MS) as libc::c_int;
            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd.as_raw_fd(),
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        timeout,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let errno = Errno::last();
                if errno != Errno::EINTR {
                    kerror!(target: "system", "{} epoll_wait failed: {}", self.base.name(), errno);
                    break 0;
                }
            };

            let expired = self.timers.list_expired_callbacks();
            if !expired.is_empty() {
                let tasks = expired
                    .into_iter()
                    .map(|cb| Task::call(move || cb()))
                    .collect();
                self.schedule_batch(tasks);
            }

            for ev in &events[..n] {
                let revents = ev.events;
                let fd = ev.u64 as RawFd;
                if fd == tickle_fd {
                    self.drain_tickle();
                } else {
                    self.handle_ready(fd, revents);
                }
            }

            Fiber::yield_to_hold();
        }
    }

    fn as_io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        Some(self)
    }
}

impl fmt::Display for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base, f)?;
        write!(f, "\n    pending_events={}", self.pending_event_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    fn write_byte(fd: RawFd) {
        assert_eq!(unsafe { libc::write(fd, b"x".as_ptr().cast(), 1) }, 1);
    }

    #[test]
    fn test_start_and_stop() {
        let iom = IoManager::new(2, false, "io_basic").unwrap();
        assert_eq!(iom.base().thread_ids().len(), 2);
        assert!(!iom.stopping());
        iom.stop();
        assert!(iom.stopping());
    }

    #[test]
    fn test_callback_on_readable() {
        let iom = IoManager::new(1, false, "io_cb").unwrap();
        let (r, w) = pipe();
        let (tx, rx) = mpsc::channel();

        iom.add_event(r, Event::Read, Some(Box::new(move || {
            let _ = tx.send(());
        })))
        .unwrap();
        assert_eq!(iom.pending_event_count(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        write_byte(w);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(iom.pending_event_count(), 0);
        assert_eq!(iom.context(r).unwrap().events(), 0);

        iom.stop();
        close(&[r, w]);
    }

    #[test]
    fn test_fiber_waits_for_readable() {
        let iom = IoManager::new(2, false, "io_fiber").unwrap();
        let (r, w) = pipe();
        let (tx, rx) = mpsc::channel();

        iom.schedule(Task::call(move || {
            let iom = IoManager::this().unwrap();
            iom.add_event(r, Event::Read, None).unwrap();
            Fiber::yield_to_hold();

            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(r, buf.as_mut_ptr().cast(), buf.len()) };
            let _ = tx.send(n);
        }));

        std::thread::sleep(Duration::from_millis(30));
        write_byte(w);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);

        iom.stop();
        close(&[r, w]);
    }

    #[test]
    fn test_cancel_event_fires_waiter() {
        let iom = IoManager::new(1, false, "io_cancel").unwrap();
        let (r, w) = pipe();
        let (tx, rx) = mpsc::channel();

        iom.add_event(r, Event::Read, Some(Box::new(move || {
            let _ = tx.send(());
        })))
        .unwrap();
        assert!(iom.cancel_event(r, Event::Read));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!iom.cancel_event(r, Event::Read));
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        close(&[r, w]);
    }

    #[test]
    fn test_del_event_is_silent() {
        let iom = IoManager::new(1, false, "io_del").unwrap();
        let (r, w) = pipe();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        iom.add_event(r, Event::Read, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
            .unwrap();
        assert!(iom.del_event(r, Event::Read));
        assert!(!iom.del_event(r, Event::Read));
        write_byte(w);

        iom.stop();
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(iom.pending_event_count(), 0);
        close(&[r, w]);
    }

    /// Write into `fd` until the socket buffer is full
    fn fill(fd: RawFd) {
        let chunk = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::send(fd, chunk.as_ptr().cast(), chunk.len(), libc::MSG_DONTWAIT)
            };
            if n == -1 {
                assert_eq!(Errno::last(), Errno::EAGAIN);
                return;
            }
        }
    }

    #[test]
    fn test_cancel_all_wakes_both_directions() {
        let iom = IoManager::new(1, false, "io_all").unwrap();
        let mut sv = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) },
            0
        );
        fill(sv[0]);
        let fired = Arc::new(Mutex::new(Vec::new()));

        let f = fired.clone();
        iom.add_event(sv[0], Event::Read, Some(Box::new(move || {
            f.lock().push(Event::Read);
        })))
        .unwrap();
        let f = fired.clone();
        iom.add_event(sv[0], Event::Write, Some(Box::new(move || {
            f.lock().push(Event::Write);
        })))
        .unwrap();
        assert_eq!(iom.context(sv[0]).unwrap().events(), EPOLLIN | EPOLLOUT);
        assert_eq!(iom.pending_event_count(), 2);

        assert!(iom.cancel_all(sv[0]));
        assert!(!iom.cancel_all(sv[0]));
        assert_eq!(iom.context(sv[0]).unwrap().events(), 0);
        iom.stop();

        let mut fired = fired.lock().clone();
        fired.sort_by_key(|e| e.bits());
        assert_eq!(fired, vec![Event::Read, Event::Write]);
        assert_eq!(iom.pending_event_count(), 0);
        close(&sv);
    }

    #[test]
    fn test_table_grows_for_large_fd() {
        let iom = IoManager::new(1, false, "io_grow").unwrap();
        let (r, w) = pipe();
        let high = unsafe { libc::fcntl(r, libc::F_DUPFD, 200) };
        assert!(high >= 200);

        iom.add_event(high, Event::Read, Some(Box::new(|| {}))).unwrap();
        assert!(iom.contexts.read().len() >= high as usize + 1);
        assert!(iom.del_event(high, Event::Read));

        iom.stop();
        close(&[r, w, high]);
    }

    #[test]
    fn test_add_event_reports_poller_error() {
        let iom = IoManager::new(1, false, "io_err").unwrap();
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        let fd = file.as_raw_fd();

        let err = iom.add_event(fd, Event::Read, None).unwrap_err();
        assert!(matches!(err, SchedError::Poller { op: "EPOLL_CTL_ADD", errno, .. } if errno == libc::EPERM));
        assert_eq!(iom.pending_event_count(), 0);
        assert_eq!(iom.context(fd).unwrap().events(), 0);
        iom.stop();
    }

    #[test]
    fn test_timer_fires_on_worker() {
        let iom = IoManager::new(1, false, "io_timer").unwrap();
        let worker = iom.base().thread_ids()[0];
        let (tx, rx) = mpsc::channel();

        let tx = Mutex::new(tx);
        iom.add_timer(20, move || {
            let _ = tx.lock().send(fibrio_core::thread_id());
        }, false);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), worker);
        iom.stop();
    }

    #[test]
    fn test_recurring_timer_until_cancelled() {
        let iom = IoManager::new(2, false, "io_recur").unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let timer = iom.add_timer(5, move || {
            t.fetch_add(1, Ordering::SeqCst);
        }, true);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(timer.cancel());
        assert!(!iom.has_timer());
        iom.stop();
    }

    #[test]
    fn test_stop_waits_for_timers() {
        let iom = IoManager::new(1, false, "io_drain").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        iom.add_timer(50, move || f.store(true, Ordering::SeqCst), false);
        iom.stop();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_use_caller_runs_in_stop() {
        std::thread::spawn(|| {
            let iom = IoManager::new(1, true, "io_caller").unwrap();
            assert!(Arc::ptr_eq(&IoManager::this().unwrap(), &iom));

            let ran = Arc::new(AtomicBool::new(false));
            let r = ran.clone();
            iom.schedule(Task::call(move || r.store(true, Ordering::SeqCst)));
            iom.stop();
            assert!(ran.load(Ordering::SeqCst));
            assert!(IoManager::this().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_this_outside_runtime() {
        std::thread::spawn(|| assert!(IoManager::this().is_none()))
            .join()
            .unwrap();
    }
}
