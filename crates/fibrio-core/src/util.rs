//! Clock, thread id, errno and backtrace helpers

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;

/// OS thread id (`gettid()` on Linux)
pub type ThreadId = i32;

thread_local! {
    static CACHED_TID: Cell<ThreadId> = const { Cell::new(0) };
}

/// Kernel thread id of the calling thread, cached per thread
#[inline(never)]
pub fn thread_id() -> ThreadId {
    CACHED_TID.with(|cell| {
        let tid = cell.get();
        if tid != 0 {
            return tid;
        }
        let tid = raw_thread_id();
        cell.set(tid);
        tid
    })
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn raw_thread_id() -> ThreadId {
            unsafe { libc::syscall(libc::SYS_gettid) as ThreadId }
        }
    } else {
        fn raw_thread_id() -> ThreadId {
            use std::sync::atomic::{AtomicI32, Ordering};
            static NEXT: AtomicI32 = AtomicI32::new(1);
            NEXT.fetch_add(1, Ordering::Relaxed)
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
///
/// Not monotonic. `TimerManager` detects backward jumps of this clock.
#[inline]
pub fn current_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Wall-clock microseconds since the Unix epoch
#[inline]
pub fn current_us() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as u64,
        Err(_) => 0,
    }
}

/// Current thread's errno
#[inline]
pub fn errno() -> i32 {
    Errno::last_raw()
}

/// Set the current thread's errno
#[inline]
pub fn set_errno(value: i32) {
    Errno::set_raw(value)
}

/// Capture a backtrace of the calling stack as text
///
/// Always captured, regardless of `RUST_BACKTRACE`.
pub fn backtrace_string() -> String {
    std::backtrace::Backtrace::force_capture().to_string()
}
