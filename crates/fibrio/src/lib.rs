//! # fibrio - fibers, an epoll scheduler and blocking-style I/O
//!
//! Stackful fibers multiplexed over a small pool of OS threads. Code inside
//! a fiber calls ordinary blocking-looking functions (`hook::read`,
//! `TcpStream::read`, `sleep_ms`, ...) and the runtime parks the fiber
//! until the fd is ready or the timer fires, while the thread moves on to
//! other fibers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fibrio::{Runtime, SchedulerConfig, spawn, sleep_ms};
//!
//! fn main() -> fibrio::SchedResult<()> {
//!     let rt = Runtime::new(SchedulerConfig::new().threads(2).use_caller(false))?;
//!
//!     rt.spawn(|| {
//!         sleep_ms(10);
//!         spawn(|| println!("spawned from a fiber")).unwrap();
//!     });
//!
//!     // drop waits for every fiber, event and timer
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        spawn(), yield_now(), sleep_ms(), TcpStream          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Hook layer / fd manager                    │
//! │     EAGAIN -> add_event + yield, timeouts via timers        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              IOManager (Scheduler + epoll + timers)         │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │  Thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

use std::sync::Arc;

// Re-export core types
pub use fibrio_core::{
    FiberId,
    FiberState,
    FiberFailure,
    SchedError,
    SchedResult,
    ConfigError,
    Config,
    ConfigVar,
    ThreadId,
    thread_id,
};

// Re-export kprint macros for logging
pub use fibrio_core::{kprint, kprintln, klog, kerror, kwarn, kinfo, kdebug, ktrace, kfatal, kassert};
pub use fibrio_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled, set_time_enabled};

// Re-export env utilities
pub use fibrio_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use fibrio_runtime::{
    SchedulerConfig,
    Fiber,
    Timer,
    TimerManager,
    Scheduler,
    BasicScheduler,
    Task,
    Event,
    IoManager,
    TcpListener,
    TcpStream,
};
pub use fibrio_runtime::{config, hook, scheduler};

/// Owns an IOManager and stops it when dropped
///
/// With `use_caller`, the runtime must be dropped (or shut down) on the
/// thread that created it: that thread runs its share of the queued work
/// inside `shutdown()`.
pub struct Runtime {
    iom: Arc<IoManager>,
    stopped: bool,
}

impl Runtime {
    /// Create and start an IOManager from `config`
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        let iom = IoManager::from_config(&config)?;
        Ok(Self {
            iom,
            stopped: false,
        })
    }

    /// Run `f` in a new fiber
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.iom.schedule(Task::call(f));
    }

    /// Run `f` in a new fiber on the worker with kernel thread id `thread`
    pub fn spawn_on<F>(&self, thread: ThreadId, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.iom.schedule(Task::call(f).on_thread(thread));
    }

    pub fn io_manager(&self) -> &Arc<IoManager> {
        &self.iom
    }

    /// Wait for all fibers, pending events and timers, then join the workers
    pub fn shutdown(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.iom.stop();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `f` in a new fiber on the scheduler driving this thread
///
/// Fails with `SchedError::NoIoManager` outside a scheduler.
pub fn spawn<F>(f: F) -> SchedResult<()>
where
    F: FnOnce() + Send + 'static,
{
    let sched = scheduler::this().ok_or(SchedError::NoIoManager)?;
    sched.schedule(Task::call(f));
    Ok(())
}

/// Let other fibers run; the current one stays runnable
///
/// Outside a scheduled fiber this yields the OS thread.
#[inline]
pub fn yield_now() {
    if fibrio_runtime::tls::has_scheduler() && !Fiber::current().is_root() {
        Fiber::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

/// Sleep without blocking the worker thread when called from a fiber
pub fn sleep_ms(ms: u64) {
    let req = libc::timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
    };
    hook::nanosleep(&req, None);
}

/// Id of the running fiber, `FiberId::ROOT` outside one
#[inline]
pub fn current_fiber_id() -> FiberId {
    Fiber::current_id()
}
