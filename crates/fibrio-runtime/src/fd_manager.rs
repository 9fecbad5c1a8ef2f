//! Per-fd metadata for the hook layer
//!
//! Records, for every fd the hook layer has seen, whether it is a socket,
//! whether the runtime forced it non-blocking, whether the user asked for
//! non-blocking mode, and the user's receive/send timeouts. The kernel-level
//! flag and the user's view are tracked separately so a hooked `fcntl` can
//! report back what the user set.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use fibrio_core::constants::NO_TIMEOUT;
use fibrio_core::{kassert, kdebug};
use parking_lot::{Mutex, RwLock};

use crate::iomanager::IoManager;

/// Which timeout `timeout`/`set_timeout` refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

impl TimeoutKind {
    /// Map `SO_RCVTIMEO`/`SO_SNDTIMEO` to a kind
    pub fn from_sockopt(optname: libc::c_int) -> Option<Self> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

/// Metadata for one fd
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    is_closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
    /// IOManager the last hooked wait on this fd registered with
    waiter_io: Mutex<Option<Weak<IoManager>>>,
}

impl FdCtx {
    /// Inspect `fd`; sockets are switched to non-blocking mode at the OS level
    pub fn new(fd: RawFd) -> Self {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_init = unsafe { libc::fstat(fd, &mut st) } == 0;
        let is_socket = is_init && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                sys_nonblock = true;
            }
        }

        Self {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
            waiter_io: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `fstat` succeeded when the context was created
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// IOManager holding waiters for this fd, if it is still alive
    pub fn waiter_io_manager(&self) -> Option<Arc<IoManager>> {
        self.waiter_io.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_waiter_io_manager(&self, iom: &Arc<IoManager>) {
        *self.waiter_io.lock() = Some(Arc::downgrade(iom));
    }

    /// Timeout in ms, `NO_TIMEOUT` if unset
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

/// Table of `FdCtx`, indexed by fd
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FdManager {
    pub fn new() -> Self {
        Self {
            fds: RwLock::new(vec![None; 64]),
        }
    }

    /// Context for `fd`, created on demand when `auto_create` is set
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let fds = self.fds.read();
            match fds.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut fds = self.fds.write();
        if idx >= fds.len() {
            fds.resize((idx * 3 / 2).max(idx + 1), None);
        }
        if let Some(ctx) = &fds[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        kdebug!("fd {} tracked, socket={}", fd, ctx.is_socket());
        fds[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget `fd`; holders of its context see it as closed
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write();
        if let Some(slot) = fds.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                kassert!(ctx.fd() == fd, "fd table slot {} holds fd {}", fd, ctx.fd());
                ctx.is_closed.store(true, Ordering::Release);
            }
        }
    }
}

static FD_MANAGER: LazyLock<FdManager> = LazyLock::new(FdManager::new);

/// Process-wide fd table
pub fn fd_manager() -> &'static FdManager {
    &FD_MANAGER
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> [RawFd; 2] {
        let mut sv = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) },
            0
        );
        sv
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let sv = socketpair();
        let ctx = FdCtx::new(sv[0]);
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = unsafe { libc::fcntl(sv[0], libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        unsafe {
            libc::close(sv[0]);
            libc::close(sv[1]);
        }
    }

    #[test]
    fn test_pipe_is_not_socket() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = FdCtx::new(fds[0]);
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_bad_fd_not_init() {
        let ctx = FdCtx::new(-1);
        assert!(!ctx.is_init());
        assert!(!ctx.is_socket());
    }

    #[test]
    fn test_timeouts() {
        let sv = socketpair();
        let ctx = FdCtx::new(sv[0]);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        ctx.set_timeout(TimeoutKind::Recv, 250);
        ctx.set_timeout(TimeoutKind::Send, 10);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), 10);
        assert_eq!(TimeoutKind::from_sockopt(libc::SO_SNDTIMEO), Some(TimeoutKind::Send));
        assert_eq!(TimeoutKind::from_sockopt(libc::SO_LINGER), None);
        unsafe {
            libc::close(sv[0]);
            libc::close(sv[1]);
        }
    }

    #[test]
    fn test_manager_get_and_del() {
        let mgr = FdManager::new();
        let sv = socketpair();
        assert!(mgr.get(sv[0], false).is_none());

        let ctx = mgr.get(sv[0], true).unwrap();
        assert!(Arc::ptr_eq(&ctx, &mgr.get(sv[0], false).unwrap()));

        mgr.del(sv[0]);
        assert!(ctx.is_closed());
        assert!(mgr.get(sv[0], false).is_none());
        assert!(mgr.get(-3, true).is_none());
        unsafe {
            libc::close(sv[0]);
            libc::close(sv[1]);
        }
    }

    #[test]
    fn test_manager_grows() {
        let mgr = FdManager::new();
        let sv = socketpair();
        let high = unsafe { libc::fcntl(sv[0], libc::F_DUPFD, 300) };
        assert!(high >= 300);
        let ctx = mgr.get(high, true).unwrap();
        assert_eq!(ctx.fd(), high);
        assert!(mgr.fds.read().len() > high as usize);
        unsafe {
            libc::close(high);
            libc::close(sv[0]);
            libc::close(sv[1]);
        }
    }
}
