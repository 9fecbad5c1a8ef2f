//! Fiber-aware wrappers over blocking libc calls
//!
//! Each function mirrors its libc namesake: same arguments (slices where a
//! raw buffer would be), same return convention, `errno` set on failure.
//! On a thread where hooks are enabled (every scheduler worker), calls that
//! would block instead park the calling fiber until the fd is ready, a
//! timeout fires, or the fd is closed. Everywhere else they go straight to
//! libc.
//!
//! Only fds the runtime knows about take the cooperative path: sockets
//! created through `socket`/`accept` here, or registered explicitly with
//! `fd_manager().get(fd, true)`.
//!
//! ```rust,ignore
//! let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//! unsafe { hook::connect(fd, addr.as_ptr(), addr.len()) };
//! let n = hook::read(fd, &mut buf); // parks the fiber on EAGAIN
//! ```

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Once};

use fibrio_core::constants::NO_TIMEOUT;
use fibrio_core::util::{errno, set_errno};
use fibrio_core::{kerror, kinfo};
use libc::{c_int, c_uint, c_ulong, c_void, sockaddr, socklen_t};

use crate::config;
use crate::fd_manager::{fd_manager, FdCtx, TimeoutKind};
use crate::fiber::Fiber;
use crate::iomanager::{Event, IoManager};
use crate::scheduler::{Scheduler, Task};
use crate::timer::Timer;
use crate::tls;

/// Timeout for `connect`, mirrored from `tcp.connect.timeout`
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NO_TIMEOUT);

static HOOK_INIT: Once = Once::new();

/// Whether hooked calls on this thread take the cooperative path
pub fn is_hook_enabled() -> bool {
    tls::hook_enabled()
}

pub fn set_hook_enabled(flag: bool) {
    tls::set_hook_enabled(flag);
}

fn connect_timeout_from(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or(NO_TIMEOUT)
}

/// Load `tcp.connect.timeout` and follow its changes. Idempotent.
pub fn hook_init() {
    HOOK_INIT.call_once(|| {
        let var = config::tcp_connect_timeout();
        CONNECT_TIMEOUT_MS.store(connect_timeout_from(var.get_value()), Ordering::Release);
        var.add_listener(|old, new| {
            kinfo!(target: "system", "tcp connect timeout changed from {} to {}", old, new);
            CONNECT_TIMEOUT_MS.store(connect_timeout_from(*new), Ordering::Release);
        });
    });
}

/// Timeout the hooked `connect` uses, `NO_TIMEOUT` if none
pub fn connect_timeout_ms() -> u64 {
    hook_init();
    CONNECT_TIMEOUT_MS.load(Ordering::Acquire)
}

/// Shared between a parked fiber and its timeout timer
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// Arm a timer that fails the wait on `fd` with ETIMEDOUT
fn arm_timeout(
    iom: &Arc<IoManager>,
    timeout_ms: u64,
    info: &Arc<TimerInfo>,
    fd: RawFd,
    event: Event,
) -> Option<Arc<Timer>> {
    if timeout_ms == NO_TIMEOUT {
        return None;
    }
    let winfo = Arc::downgrade(info);
    let wiom = Arc::downgrade(iom);
    let cb = {
        let winfo = winfo.clone();
        move || {
            let Some(info) = winfo.upgrade() else {
                return;
            };
            if info
                .cancelled
                .compare_exchange(0, libc::ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            if let Some(iom) = wiom.upgrade() {
                iom.cancel_event(fd, event);
            }
        }
    };
    Some(iom.add_condition_timer(timeout_ms, cb, winfo, false))
}

/// Tracked socket context, unless the fd is closed or not a socket
fn tracked_socket(fd: RawFd) -> Option<Arc<FdCtx>> {
    fd_manager()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
}

/// How a parked wait on an fd ended
enum Wait {
    /// The event fired, or the fd was cancelled without an error code
    Ready,
    /// The timeout elapsed; carries the errno to report
    Cancelled(c_int),
    /// Interest could not be registered; carries the errno to report
    Unregistered(c_int),
}

/// Park the current fiber until `event` fires on `ctx`'s fd or `timeout_ms` elapses
fn wait_event(
    iom: &Arc<IoManager>,
    ctx: &FdCtx,
    event: Event,
    timeout_ms: u64,
    info: &Arc<TimerInfo>,
    name: &str,
) -> Wait {
    let fd = ctx.fd();
    let timer = arm_timeout(iom, timeout_ms, info, fd, event);

    ctx.set_waiter_io_manager(iom);
    if let Err(e) = iom.add_event(fd, event, None) {
        kerror!(target: "system", "{} add_event({}, {:?}) failed: {}", name, fd, event, e);
        if let Some(timer) = timer {
            timer.cancel();
        }
        return Wait::Unregistered(e.raw_os_error().unwrap_or(libc::EIO));
    }

    // a timeout that fired before the registration cancelled nothing
    let early = info.cancelled.load(Ordering::Acquire);
    if early != 0 && iom.del_event(fd, event) {
        return Wait::Cancelled(early);
    }

    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    match info.cancelled.load(Ordering::Acquire) {
        0 => Wait::Ready,
        err => Wait::Cancelled(err),
    }
}

/// Run `io` until it does not report EAGAIN, parking the fiber in between
fn do_io<F>(fd: RawFd, name: &str, event: Event, kind: TimeoutKind, mut io: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hook_enabled() {
        return io();
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return io();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return io();
    }

    let timeout = ctx.timeout(kind);
    let info = Arc::new(TimerInfo::default());

    loop {
        let mut n = io();
        while n == -1 && errno() == libc::EINTR {
            n = io();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let Some(iom) = IoManager::this() else {
            set_errno(libc::EAGAIN);
            return n;
        };

        match wait_event(&iom, &ctx, event, timeout, &info, name) {
            Wait::Ready => {}
            Wait::Cancelled(err) | Wait::Unregistered(err) => {
                set_errno(err);
                return -1;
            }
        }
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> isize {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, bufs.as_mut_ptr().cast(), bufs.len() as c_int)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> isize {
    do_io(fd, "recv", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
    })
}

/// # Safety
/// `addr`/`addrlen` must be null or valid as for `recvfrom(2)`.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    do_io(fd, "recvfrom", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(fd, buf.as_mut_ptr().cast(), buf.len(), flags, addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid `msghdr` as for `recvmsg(2)`.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "recvmsg", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, "write", Event::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len())
    })
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> isize {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, bufs.as_ptr().cast(), bufs.len() as c_int)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> isize {
    do_io(fd, "send", Event::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr().cast(), buf.len(), flags)
    })
}

/// # Safety
/// `addr` must be null or point to `addrlen` valid bytes.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> isize {
    do_io(fd, "sendto", Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, buf.as_ptr().cast(), buf.len(), flags, addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid `msghdr` as for `sendmsg(2)`.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "sendmsg", Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Park the current fiber for `ms` on its IOManager
fn park_for(iom: &Arc<IoManager>, ms: u64) {
    let fiber = Fiber::current();
    let wiom = Arc::downgrade(iom);
    iom.add_timer(
        ms,
        move || {
            if let Some(iom) = wiom.upgrade() {
                iom.schedule(Task::fiber(fiber.clone()));
            }
        },
        false,
    );
    Fiber::yield_to_hold();
}

/// IOManager to park on, if this thread is hooked
fn hooked_io_manager() -> Option<Arc<IoManager>> {
    if is_hook_enabled() {
        IoManager::this()
    } else {
        None
    }
}

pub fn sleep(secs: c_uint) -> c_uint {
    match hooked_io_manager() {
        Some(iom) => {
            park_for(&iom, u64::from(secs) * 1000);
            0
        }
        None => unsafe { libc::sleep(secs) },
    }
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    match hooked_io_manager() {
        Some(iom) => {
            park_for(&iom, u64::from(usec) / 1000);
            0
        }
        None => unsafe { libc::usleep(usec) },
    }
}

/// `timespec` as whole ms, saturating; `None` if out of range for `nanosleep(2)`
fn timespec_to_ms(ts: &libc::timespec) -> Option<u64> {
    if ts.tv_sec < 0 || !(0..1_000_000_000).contains(&ts.tv_nsec) {
        return None;
    }
    Some((ts.tv_sec as u64).saturating_mul(1000).saturating_add(ts.tv_nsec as u64 / 1_000_000))
}

pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> c_int {
    match hooked_io_manager() {
        Some(iom) => {
            let Some(ms) = timespec_to_ms(req) else {
                set_errno(libc::EINVAL);
                return -1;
            };
            park_for(&iom, ms);
            0
        }
        None => {
            let rem = rem.map_or(std::ptr::null_mut(), |r| r as *mut libc::timespec);
            unsafe { libc::nanosleep(req, rem) }
        }
    }
}

/// `socket(2)`; on a hooked thread the new fd is tracked and made non-blocking
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd != -1 && is_hook_enabled() {
        fd_manager().get(fd, true);
    }
    fd
}

/// `connect(2)` that parks the fiber for at most `timeout_ms`
///
/// # Safety
/// `addr` must point to `addrlen` valid bytes.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return unsafe { libc::connect(fd, addr, addrlen) };
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
    let Some(iom) = IoManager::this() else {
        set_errno(libc::EINPROGRESS);
        return n;
    };

    let info = Arc::new(TimerInfo::default());
    match wait_event(&iom, &ctx, Event::Write, timeout_ms, &info, "connect") {
        Wait::Cancelled(err) => {
            set_errno(err);
            return -1;
        }
        Wait::Ready | Wait::Unregistered(_) => {}
    }

    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut error as *mut c_int).cast::<c_void>(),
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

/// `connect(2)` bounded by `tcp.connect.timeout`
///
/// # Safety
/// `addr` must point to `addrlen` valid bytes.
pub unsafe fn connect(fd: RawFd, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    unsafe { connect_with_timeout(fd, addr, addrlen, connect_timeout_ms()) }
}

/// # Safety
/// `addr`/`addrlen` must be null or valid as for `accept(2)`.
pub unsafe fn accept(fd: RawFd, addr: *mut sockaddr, addrlen: *mut socklen_t) -> RawFd {
    let n = do_io(fd, "accept", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    }) as RawFd;
    if n >= 0 && is_hook_enabled() {
        fd_manager().get(n, true);
    }
    n
}

/// `close(2)`, first waking every fiber parked on `fd`
///
/// Waiters are woken through the IOManager they registered with, so a
/// close from any thread releases them.
pub fn close(fd: RawFd) -> c_int {
    if let Some(ctx) = fd_manager().get(fd, false) {
        // parked fibers must see the fd closed when they wake
        fd_manager().del(fd);
        if let Some(iom) = ctx.waiter_io_manager().or_else(hooked_io_manager) {
            iom.cancel_all(fd);
        }
    }
    unsafe { libc::close(fd) }
}

/// `fcntl(2)` for integer-argument commands
///
/// On tracked sockets `F_SETFL`/`F_GETFL` read and write the user's view of
/// `O_NONBLOCK`; the kernel flag stays as the runtime set it.
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = tracked_socket(fd) else {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            };
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
            if flags == -1 {
                return flags;
            }
            match tracked_socket(fd) {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `fcntl(2)` for pointer-argument commands (`F_GETLK`, `F_SETOWN_EX`, ...)
///
/// # Safety
/// `arg` must be valid for `cmd`.
pub unsafe fn fcntl_ptr(fd: RawFd, cmd: c_int, arg: *mut c_void) -> c_int {
    unsafe { libc::fcntl(fd, cmd, arg) }
}

/// `ioctl(2)`; `FIONBIO` on a tracked socket only changes the user's view
///
/// # Safety
/// `arg` must be valid for `request`.
pub unsafe fn ioctl(fd: RawFd, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let on = unsafe { *arg.cast::<c_int>() } != 0;
        if let Some(ctx) = tracked_socket(fd) {
            ctx.set_user_nonblock(on);
        }
    }
    unsafe { libc::ioctl(fd, request as _, arg) }
}

/// # Safety
/// As for `getsockopt(2)`.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

fn timeval_to_ms(tv: &libc::timeval) -> u64 {
    if tv.tv_sec <= 0 && tv.tv_usec <= 0 {
        return NO_TIMEOUT;
    }
    let ms = (tv.tv_sec.max(0) as u64)
        .saturating_mul(1000)
        .saturating_add(tv.tv_usec.max(0) as u64 / 1000);
    ms.max(1)
}

/// `setsockopt(2)`; on a hooked thread `SO_RCVTIMEO`/`SO_SNDTIMEO` also set
/// the timeout the hooked I/O calls wait for
///
/// # Safety
/// `optval` must point to `optlen` valid bytes.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled() && level == libc::SOL_SOCKET {
        if let Some(kind) = TimeoutKind::from_sockopt(optname) {
            let fits = optlen as usize >= std::mem::size_of::<libc::timeval>();
            if let (Some(ctx), true) = (fd_manager().get(fd, false), fits && !optval.is_null()) {
                let tv = unsafe { &*optval.cast::<libc::timeval>() };
                ctx.set_timeout(kind, timeval_to_ms(tv));
            }
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    fn socketpair() -> [RawFd; 2] {
        let mut sv = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) },
            0
        );
        sv
    }

    /// Run `f` in a fiber on `iom` and wait for its result
    fn run_in_fiber<T, F>(iom: &Arc<IoManager>, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        iom.schedule(Task::call(move || {
            let _ = tx.send(f());
        }));
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_passthrough_when_disabled() {
        std::thread::spawn(|| {
            assert!(!is_hook_enabled());
            let sv = socketpair();
            assert_eq!(write(sv[1], b"ping"), 4);
            let mut buf = [0u8; 8];
            assert_eq!(read(sv[0], &mut buf), 4);
            assert_eq!(&buf[..4], b"ping");
            assert_eq!(usleep(1000), 0);

            let flags = fcntl(sv[0], libc::F_GETFL, 0);
            assert_eq!(fcntl(sv[0], libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
            assert_eq!(read(sv[0], &mut buf), -1);
            assert_eq!(errno(), libc::EAGAIN);
            assert_eq!(recv(sv[0], &mut buf, 0), -1);
            assert_eq!(errno(), libc::EAGAIN);

            assert_eq!(close(sv[0]), 0);
            assert_eq!(close(sv[1]), 0);
            assert_eq!(read(-1, &mut buf), -1);
            assert_eq!(errno(), libc::EBADF);
            assert_eq!(write(-1, b"x"), -1);
            assert_eq!(errno(), libc::EBADF);
            assert_eq!(close(-1), -1);
            assert_eq!(errno(), libc::EBADF);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_workers_are_hooked() {
        let iom = IoManager::new(1, false, "hook_flag").unwrap();
        assert!(run_in_fiber(&iom, is_hook_enabled));
        iom.stop();
    }

    #[test]
    fn test_read_parks_fiber_not_thread() {
        let iom = IoManager::new(1, false, "hook_read").unwrap();
        let sv = socketpair();
        fd_manager().get(sv[0], true);

        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let o = order.clone();
        iom.schedule(Task::call(move || {
            let mut buf = [0u8; 16];
            let n = read(sv[0], &mut buf);
            o.lock().push("reader");
            let _ = tx.send(buf[..n.max(0) as usize].to_vec());
        }));

        let o = order.clone();
        run_in_fiber(&iom, move || o.lock().push("other"));
        assert_eq!(unsafe { libc::write(sv[1], b"hello".as_ptr().cast(), 5) }, 5);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"hello");
        assert_eq!(*order.lock(), vec!["other", "reader"]);

        iom.stop();
        close(sv[0]);
        close(sv[1]);
    }

    #[test]
    fn test_recv_timeout() {
        let iom = IoManager::new(1, false, "hook_timeout").unwrap();
        let sv = socketpair();
        fd_manager().get(sv[0], true);

        let (rc, err, elapsed) = run_in_fiber(&iom, move || {
            let tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 50_000,
            };
            let rc = unsafe {
                setsockopt(
                    sv[0],
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    (&tv as *const libc::timeval).cast(),
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                )
            };
            assert_eq!(rc, 0);

            let start = Instant::now();
            let mut buf = [0u8; 4];
            let rc = recv(sv[0], &mut buf, 0);
            (rc, errno(), start.elapsed())
        });

        assert_eq!(rc, -1);
        assert_eq!(err, libc::ETIMEDOUT);
        assert!(elapsed >= Duration::from_millis(40));
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        close(sv[0]);
        close(sv[1]);
    }

    #[test]
    fn test_sleep_yields_worker() {
        let iom = IoManager::new(1, false, "hook_sleep").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        iom.schedule(Task::call(move || {
            usleep(100_000);
            o.lock().push("sleeper");
        }));
        let o = order.clone();
        iom.schedule(Task::call(move || o.lock().push("quick")));

        iom.stop();
        assert_eq!(*order.lock(), vec!["quick", "sleeper"]);
    }

    #[test]
    fn test_nanosleep_in_fiber() {
        let iom = IoManager::new(1, false, "hook_nano").unwrap();
        let elapsed = run_in_fiber(&iom, || {
            let start = Instant::now();
            let req = libc::timespec {
                tv_sec: 0,
                tv_nsec: 30_000_000,
            };
            assert_eq!(nanosleep(&req, None), 0);
            start.elapsed()
        });
        assert!(elapsed >= Duration::from_millis(25));
        iom.stop();
    }

    #[test]
    fn test_close_wakes_parked_reader() {
        let iom = IoManager::new(2, false, "hook_close").unwrap();
        let sv = socketpair();
        fd_manager().get(sv[0], true);

        let started = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let s = started.clone();
        iom.schedule(Task::call(move || {
            s.store(true, Ordering::SeqCst);
            let mut buf = [0u8; 4];
            let rc = read(sv[0], &mut buf);
            let _ = tx.send((rc, errno()));
        }));

        let deadline = Instant::now() + Duration::from_secs(5);
        while iom.pending_event_count() == 0 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(started.load(Ordering::SeqCst));

        assert_eq!(run_in_fiber(&iom, move || close(sv[0])), 0);
        let (rc, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rc, -1);
        assert_eq!(err, libc::EBADF);

        iom.stop();
        close(sv[1]);
    }

    /// Write into `fd` until the socket buffer is full
    fn fill(fd: RawFd) {
        let chunk = [0u8; 4096];
        while unsafe { libc::send(fd, chunk.as_ptr().cast(), chunk.len(), libc::MSG_DONTWAIT) } > 0 {}
        assert_eq!(errno(), libc::EAGAIN);
    }

    fn wait_for_pending(iom: &IoManager, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while iom.pending_event_count() < n {
            assert!(Instant::now() < deadline, "waiters never parked");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_close_from_plain_thread_wakes_reader_and_writer() {
        let iom = IoManager::new(1, false, "hook_close_rw").unwrap();
        let sv = socketpair();
        fd_manager().get(sv[0], true);
        fill(sv[0]);

        let (tx, rx) = mpsc::channel();
        let t = tx.clone();
        iom.schedule(Task::call(move || {
            let mut buf = [0u8; 4];
            let rc = read(sv[0], &mut buf);
            let _ = t.send(("reader", rc, errno()));
        }));
        iom.schedule(Task::call(move || {
            let rc = write(sv[0], &[7u8; 4096]);
            let _ = tx.send(("writer", rc, errno()));
        }));
        wait_for_pending(&iom, 2);

        assert!(!is_hook_enabled());
        assert_eq!(close(sv[0]), 0);

        let mut woke = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        woke.sort();
        assert_eq!(woke, vec![("reader", -1, libc::EBADF), ("writer", -1, libc::EBADF)]);
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        close(sv[1]);
    }

    #[test]
    fn test_data_after_timeout_is_read_by_next_call() {
        let iom = IoManager::new(1, false, "hook_late").unwrap();
        let sv = socketpair();
        fd_manager().get(sv[0], true);
        let (timed_out_tx, timed_out_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        iom.schedule(Task::call(move || {
            let tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 30_000,
            };
            unsafe {
                setsockopt(
                    sv[0],
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    (&tv as *const libc::timeval).cast(),
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                )
            };
            let mut buf = [0u8; 8];
            let rc = recv(sv[0], &mut buf, 0);
            let _ = timed_out_tx.send((rc, errno()));

            usleep(100_000);
            let rc = recv(sv[0], &mut buf, 0);
            let _ = done_tx.send((rc, buf[..rc.max(0) as usize].to_vec()));
        }));

        let first = timed_out_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, (-1, libc::ETIMEDOUT));
        assert_eq!(iom.pending_event_count(), 0);
        assert_eq!(unsafe { libc::write(sv[1], b"late".as_ptr().cast(), 4) }, 4);

        let (rc, data) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rc, 4);
        assert_eq!(data, b"late");
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        close(sv[0]);
        close(sv[1]);
    }

    #[test]
    fn test_timeout_before_registration_does_not_park() {
        let iom = IoManager::new(1, false, "hook_early").unwrap();
        let sv = socketpair();
        let ctx = fd_manager().get(sv[0], true).unwrap();

        let (rc, pending) = run_in_fiber(&iom, move || {
            let iom = IoManager::this().unwrap();
            let info = Arc::new(TimerInfo::default());
            info.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
            let wait = wait_event(&iom, &ctx, Event::Read, NO_TIMEOUT, &info, "recv");
            let rc = match wait {
                Wait::Cancelled(err) => err,
                Wait::Ready | Wait::Unregistered(_) => 0,
            };
            (rc, iom.pending_event_count())
        });
        assert_eq!(rc, libc::ETIMEDOUT);
        assert_eq!(pending, 0);

        iom.stop();
        close(sv[0]);
        close(sv[1]);
    }

    #[test]
    fn test_nanosleep_range() {
        let ts = |sec, nsec| libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        };
        assert_eq!(timespec_to_ms(&ts(1, 500_000_000)), Some(1500));
        assert_eq!(timespec_to_ms(&ts(libc::time_t::MAX / 2, 0)), Some(u64::MAX));
        assert_eq!(timespec_to_ms(&ts(0, 1_000_000_000)), None);
        assert_eq!(timespec_to_ms(&ts(-1, 0)), None);

        let iom = IoManager::new(1, false, "hook_nano_range").unwrap();
        let (rc, err) = run_in_fiber(&iom, move || {
            let rc = nanosleep(&ts(0, -5), None);
            (rc, errno())
        });
        assert_eq!((rc, err), (-1, libc::EINVAL));
        iom.stop();
    }

    #[test]
    fn test_fcntl_keeps_user_view() {
        let sv = socketpair();
        let ctx = fd_manager().get(sv[0], true).unwrap();
        assert!(ctx.sys_nonblock());

        let flags = fcntl(sv[0], libc::F_GETFL, 0);
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        assert_eq!(fcntl(sv[0], libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
        assert!(ctx.user_nonblock());
        assert_ne!(fcntl(sv[0], libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        assert_eq!(fcntl(sv[0], libc::F_SETFL, flags & !libc::O_NONBLOCK), 0);
        assert!(!ctx.user_nonblock());
        let real = unsafe { libc::fcntl(sv[0], libc::F_GETFL) };
        assert_ne!(real & libc::O_NONBLOCK, 0);

        close(sv[0]);
        close(sv[1]);
        assert!(ctx.is_closed());
    }

    #[test]
    fn test_ioctl_fionbio_tracks_user_flag() {
        let sv = socketpair();
        let ctx = fd_manager().get(sv[0], true).unwrap();

        let mut on: c_int = 1;
        let rc = unsafe { ioctl(sv[0], libc::FIONBIO as c_ulong, (&mut on as *mut c_int).cast()) };
        assert_eq!(rc, 0);
        assert!(ctx.user_nonblock());

        let mut off: c_int = 0;
        unsafe { ioctl(sv[0], libc::FIONBIO as c_ulong, (&mut off as *mut c_int).cast()) };
        assert!(!ctx.user_nonblock());

        close(sv[0]);
        close(sv[1]);
    }

    #[test]
    fn test_connect_refused() {
        let iom = IoManager::new(1, false, "hook_connect").unwrap();
        let (rc, err) = run_in_fiber(&iom, || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            assert!(fd_manager().get(fd, false).is_some());

            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 1u16.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(std::net::Ipv4Addr::LOCALHOST).to_be(),
                },
                sin_zero: [0; 8],
            };
            let rc = unsafe {
                connect(
                    fd,
                    (&addr as *const libc::sockaddr_in).cast(),
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            };
            let err = errno();
            close(fd);
            (rc, err)
        });
        assert_eq!(rc, -1);
        assert_eq!(err, libc::ECONNREFUSED);
        iom.stop();
    }

    #[test]
    fn test_connect_timeout_follows_config() {
        let var = config::tcp_connect_timeout();
        let original = var.get_value();
        assert_eq!(connect_timeout_ms(), connect_timeout_from(original));

        var.set_value(1234);
        assert_eq!(connect_timeout_ms(), 1234);
        var.set_value(-1);
        assert_eq!(connect_timeout_ms(), NO_TIMEOUT);
        var.set_value(original);
    }

    #[test]
    fn test_timeval_conversion() {
        let tv = |s, us| libc::timeval {
            tv_sec: s,
            tv_usec: us,
        };
        assert_eq!(timeval_to_ms(&tv(0, 0)), NO_TIMEOUT);
        assert_eq!(timeval_to_ms(&tv(2, 500_000)), 2500);
        assert_eq!(timeval_to_ms(&tv(0, 10)), 1);
        assert_eq!(timeval_to_ms(&tv(libc::time_t::MAX, 0)), u64::MAX);
    }
}
