//! Runtime configuration
//!
//! Two layers:
//!
//! - `SchedulerConfig`: how many threads an IOManager runs and whether the
//!   constructing thread joins them. Compile-time defaults with environment
//!   overrides, finished with the builder.
//! - Registered config variables that stay live for the whole process:
//!   `fiber.stack_size` and `tcp.connect.timeout`. Both can be changed at
//!   runtime through `fibrio_core::Config`.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (runtime)
//! 3. `FIBRIO_CONFIG_RS` file (compile-time)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use fibrio_runtime::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_env()
//!     .threads(4)
//!     .use_caller(false)
//!     .name("io");
//! config.validate()?;
//! ```

pub mod defaults;

use std::sync::{Arc, LazyLock};

use fibrio_core::env::{env_get, env_get_bool};
use fibrio_core::{kfatal, kprintln, Config, ConfigError, ConfigVar};

/// Upper bound on worker threads per scheduler
pub const MAX_THREADS: usize = 1024;

/// Scheduler configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total worker threads, including the caller when `use_caller` is set
    pub threads: usize,
    /// The constructing thread becomes worker 0
    pub use_caller: bool,
    /// Scheduler name, also the worker thread name prefix
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `FIBRIO_THREADS` - Number of worker threads
    /// - `FIBRIO_USE_CALLER` - Constructing thread participates (0/1)
    /// - `FIBRIO_NAME` - Scheduler name
    pub fn from_env() -> Self {
        Self {
            threads: env_get("FIBRIO_THREADS", defaults::THREADS),
            use_caller: env_get_bool("FIBRIO_USE_CALLER", defaults::USE_CALLER),
            name: env_get("FIBRIO_NAME", String::from("main")),
        }
    }

    /// Compile-time defaults only. Useful for tests.
    pub fn new() -> Self {
        Self {
            threads: defaults::THREADS,
            use_caller: defaults::USE_CALLER,
            name: String::from("main"),
        }
    }

    // Builder methods

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, enable: bool) -> Self {
        self.use_caller = enable;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be > 0"));
        }
        if self.threads > MAX_THREADS {
            return Err(ConfigError::InvalidValue("threads must be <= 1024"));
        }
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue("name must not be empty"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        kprintln!("fibrio scheduler configuration:");
        kprintln!("  name:               {}", self.name);
        kprintln!("  threads:            {}", self.threads);
        kprintln!("  use_caller:         {}", self.use_caller);
        kprintln!("  fiber.stack_size:   {}", fiber_stack_size().get_value());
        kprintln!("  tcp.connect.timeout: {}", tcp_connect_timeout().get_value());
    }
}

fn register<T: fibrio_core::config_var::ConfigValue>(
    name: &str,
    default: T,
    description: &str,
) -> Arc<ConfigVar<T>> {
    match Config::lookup(name, default, description) {
        Ok(var) => var,
        Err(e) => kfatal!("cannot register config {}: {}", name, e),
    }
}

static FIBER_STACK_SIZE: LazyLock<Arc<ConfigVar<u32>>> = LazyLock::new(|| {
    register(
        "fiber.stack_size",
        defaults::FIBER_STACK_SIZE,
        "fiber stack size",
    )
});

static TCP_CONNECT_TIMEOUT: LazyLock<Arc<ConfigVar<i64>>> = LazyLock::new(|| {
    register(
        "tcp.connect.timeout",
        defaults::TCP_CONNECT_TIMEOUT_MS,
        "tcp connect timeout in ms, negative for none",
    )
});

/// Default stack size for fibers created with `stack_size == 0`
pub fn fiber_stack_size() -> &'static Arc<ConfigVar<u32>> {
    &FIBER_STACK_SIZE
}

/// Timeout used by the hooked `connect`
pub fn tcp_connect_timeout() -> &'static Arc<ConfigVar<i64>> {
    &TCP_CONNECT_TIMEOUT
}
