//! Error types for the fibrio runtime
//!
//! Invariant violations are not represented here: they abort the process
//! through `kassert!`/`kfatal!`. Everything below is an operating condition
//! that callers are expected to handle.

use core::fmt;

use crate::id::FiberId;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler and reactor operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// `epoll_ctl` rejected a registration change
    Poller {
        op: &'static str,
        fd: i32,
        errno: i32,
    },

    /// A setup syscall (epoll_create, pipe, fcntl, ...) failed
    Os { call: &'static str, errno: i32 },

    /// Operation timed out
    TimedOut,

    /// Called from a thread that is not running an IOManager
    NoIoManager,

    /// Worker thread error
    Worker(WorkerError),

    /// Configuration error
    Config(ConfigError),

    /// Fiber stack allocation error
    Stack(StackError),
}

impl SchedError {
    /// Build an `Os` error from the calling thread's errno
    pub fn last_os(call: &'static str) -> Self {
        SchedError::Os {
            call,
            errno: crate::util::errno(),
        }
    }

    /// The errno carried by this error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            SchedError::Poller { errno, .. } | SchedError::Os { errno, .. } => Some(*errno),
            SchedError::TimedOut => Some(libc::ETIMEDOUT),
            _ => None,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Poller { op, fd, errno } => write!(
                f,
                "epoll_ctl({}, fd={}) failed: {}",
                op,
                fd,
                std::io::Error::from_raw_os_error(*errno)
            ),
            SchedError::Os { call, errno } => write!(
                f,
                "{} failed: {}",
                call,
                std::io::Error::from_raw_os_error(*errno)
            ),
            SchedError::TimedOut => write!(f, "operation timed out"),
            SchedError::NoIoManager => write!(f, "no IOManager on this thread"),
            SchedError::Worker(e) => write!(f, "worker error: {}", e),
            SchedError::Config(e) => write!(f, "config error: {}", e),
            SchedError::Stack(e) => write!(f, "stack error: {}", e),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<SchedError> for std::io::Error {
    fn from(e: SchedError) -> Self {
        match e.raw_os_error() {
            Some(errno) => std::io::Error::from_raw_os_error(errno),
            None => std::io::Error::new(std::io::ErrorKind::Other, e),
        }
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed(String),

    /// Worker thread exited before reporting its thread id
    Rendezvous,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed(msg) => write!(f, "failed to spawn worker thread: {}", msg),
            WorkerError::Rendezvous => write!(f, "worker thread exited before start-up"),
        }
    }
}

impl From<WorkerError> for SchedError {
    fn from(e: WorkerError) -> Self {
        SchedError::Worker(e)
    }
}

/// Fiber stack errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed
    AllocationFailed(i32),

    /// mprotect on the guard page failed
    ProtectionFailed(i32),

    /// Requested size below the minimum
    TooSmall(usize),
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocationFailed(errno) => write!(
                f,
                "stack allocation failed: {}",
                std::io::Error::from_raw_os_error(*errno)
            ),
            StackError::ProtectionFailed(errno) => write!(
                f,
                "guard page protection failed: {}",
                std::io::Error::from_raw_os_error(*errno)
            ),
            StackError::TooSmall(size) => write!(f, "stack size {} is too small", size),
        }
    }
}

impl From<StackError> for SchedError {
    fn from(e: StackError) -> Self {
        SchedError::Stack(e)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Name contains characters outside `[a-z0-9._]`
    InvalidName(String),

    /// Name already registered with a different value type
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Value could not be parsed for the variable's type
    Parse { name: String, value: String },

    /// Value parsed but is out of range
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidName(name) => write!(f, "invalid config name: {:?}", name),
            ConfigError::TypeMismatch {
                name,
                expected,
                found,
            } => write!(
                f,
                "config {} exists with type {}, requested {}",
                name, found, expected
            ),
            ConfigError::Parse { name, value } => {
                write!(f, "cannot parse {:?} for config {}", value, name)
            }
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for SchedError {
    fn from(e: ConfigError) -> Self {
        SchedError::Config(e)
    }
}

/// What a fiber left behind when its callback panicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberFailure {
    pub fiber_id: FiberId,
    pub message: String,
    pub backtrace: String,
}

impl FiberFailure {
    /// Extract a readable message from a `catch_unwind` payload
    pub fn from_panic(
        fiber_id: FiberId,
        payload: &(dyn std::any::Any + Send),
        backtrace: String,
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            fiber_id,
            message,
            backtrace,
        }
    }
}

impl fmt::Display for FiberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber {} panicked: {}", self.fiber_id, self.message)
    }
}
