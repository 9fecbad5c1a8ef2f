//! # fibrio-runtime
//!
//! Linux runtime for fibrio.
//!
//! This crate provides:
//! - Stackful fibers with hand-written context switching (x86_64, aarch64)
//! - A deadline-ordered timer set
//! - An N:M scheduler with optional caller-thread participation
//! - An epoll IOManager that parks fibers on fd readiness and timers
//! - A hook layer of fiber-aware libc wrappers, plus TCP types built on it
//! - Runtime configuration (compile-time defaults, env, config variables)

pub mod config;
pub mod arch;
pub mod stack;
pub mod tls;
pub mod fiber;
pub mod timer;
pub mod worker;
pub mod scheduler;
pub mod iomanager;
pub mod fd_manager;
pub mod hook;
pub mod net;

// Re-exports
pub use config::SchedulerConfig;
pub use fiber::{Fiber, FiberFn};
pub use timer::{Timer, TimerCallback, TimerManager};
pub use scheduler::{BasicScheduler, Scheduler, SchedulerBase, Task, TaskKind};
pub use iomanager::{Event, IoManager};
pub use fd_manager::{fd_manager, FdCtx, FdManager, TimeoutKind};
pub use net::{TcpListener, TcpStream};

use std::sync::Once;

static INIT: Once = Once::new();

/// One-time process setup: fiber ids in log lines and the hook config.
///
/// Called by every scheduler constructor; safe to call again.
pub fn init() {
    INIT.call_once(|| {
        fibrio_core::kprint::set_fiber_id_provider(|| Fiber::current_id().as_u64());
        hook::hook_init();
    });
}
