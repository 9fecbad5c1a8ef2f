//! # fibrio-core
//!
//! Core types for the fibrio fiber runtime.
//!
//! This crate is platform-agnostic apart from a couple of thin libc calls
//! (thread id, wall clock). Context switching, epoll and the hook layer
//! live in `fibrio-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber lifecycle states
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities
//! - `config_var` - Named, typed, observable configuration variables
//! - `util` - Clock, thread id and backtrace helpers

pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;
pub mod config_var;
pub mod util;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use error::{ConfigError, FiberFailure, SchedError, SchedResult, StackError, WorkerError};
pub use config_var::{Config, ConfigVar, ConfigVarBase};
pub use env::{env_get, env_get_bool, env_get_opt, env_key};
pub use util::{current_ms, thread_id, ThreadId};

/// Runtime-wide constants
pub mod constants {
    /// Default fiber stack size (128 KiB)
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Guard page size below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Smallest stack a fiber may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Backward clock jump that counts as a rollover (one hour)
    pub const CLOCK_ROLLOVER_MS: u64 = 60 * 60 * 1000;

    /// "No timeout" / "no timer" sentinel
    pub const NO_TIMEOUT: u64 = u64::MAX;

    /// Prefix for environment keys derived from config names
    pub const ENV_PREFIX: &str = "FIBRIO_";
}
