//! Kernel-style print macros for fibrio
//!
//! Thread-safe, optionally-flushing leveled output to stderr, keyed by a
//! logger name ("target"). Every leveled line carries the OS thread id and
//! the id of the fiber that emitted it.
//!
//! # Environment Variables
//!
//! - `FIBRIO_FLUSH_EPRINT=1` - Flush stderr after each print (useful for debugging crashes)
//! - `FIBRIO_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `FIBRIO_LOG_TIME=1` - Prefix lines with a millisecond timestamp
//!
//! # Usage
//!
//! ```ignore
//! use fibrio_core::{kinfo, kdebug, kerror, kassert};
//!
//! kinfo!("worker {} started", id);
//! kdebug!(target: "system", "epoll_wait returned {}", n);
//! kerror!(target: "system", "epoll_ctl failed: {}", err);
//! kassert!(state == FiberState::Exec, "state={}", state);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown strings give `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

// Global configuration (initialized once)
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Supplies the current fiber id; installed by the runtime
static FIBER_ID_PROVIDER: OnceLock<fn() -> u64> = OnceLock::new();

/// Initialize logging from environment variables
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("FIBRIO_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("FIBRIO_LOG_TIME") {
        let time = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        TIME_ENABLED.store(time, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("FIBRIO_LOG_LEVEL") {
        let level = LogLevel::parse(&val).unwrap_or(LogLevel::Info);
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
fn ensure_init() {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
}

/// Check if flush is enabled
#[inline]
pub fn flush_enabled() -> bool {
    ensure_init();
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    ensure_init();
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    ensure_init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Set flush mode programmatically
pub fn set_flush_enabled(enabled: bool) {
    ensure_init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Enable or disable the timestamp prefix
pub fn set_time_enabled(enabled: bool) {
    ensure_init();
    TIME_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Install the function used to tag lines with the current fiber id.
///
/// Only the first call has an effect.
pub fn set_fiber_id_provider(f: fn() -> u64) {
    let _ = FIBER_ID_PROVIDER.set(f);
}

#[inline]
fn current_fiber_id() -> u64 {
    FIBER_ID_PROVIDER.get().map(|f| f()).unwrap_or(0)
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= log_level() as u8
}

/// Internal: Write and optionally flush
#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Internal: Write with newline and optionally flush
#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

fn write_header(handle: &mut impl Write, level: LogLevel, target: &str) {
    if TIME_ENABLED.load(Ordering::Relaxed) {
        let _ = write!(handle, "{} ", crate::util::current_ms());
    }
    let _ = write!(
        handle,
        "{} [{}] {}:{} ",
        level.prefix(),
        target,
        crate::util::thread_id(),
        current_fiber_id()
    );
}

/// Internal: Leveled print
#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, target: &str, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    write_header(&mut handle, level, target);
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Internal: log an invariant violation with a backtrace, then abort
#[doc(hidden)]
#[cold]
pub fn _kfatal_impl(args: std::fmt::Arguments<'_>) -> ! {
    {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        write_header(&mut handle, LogLevel::Error, "fatal");
        let _ = handle.write_fmt(args);
        let _ = handle.write_all(b"\n");
        let _ = writeln!(handle, "{}", crate::util::backtrace_string());
        let _ = handle.flush();
    }
    std::process::abort()
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline)
///
/// Like `eprint!` but with optional auto-flush and mutex protection.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*));
    }};
}

/// Print to stderr with newline
///
/// Like `eprintln!` but with optional auto-flush and mutex protection.
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprintln_impl(format_args!($($arg)*));
    }};
}

/// Leveled log with optional `target: "name"` prefix
#[doc(hidden)]
#[macro_export]
macro_rules! klog {
    ($level:expr, target: $target:expr, $($arg:tt)+) => {{
        $crate::kprint::_klog_impl($level, $target, format_args!($($arg)+));
    }};
    ($level:expr, $($arg:tt)+) => {{
        $crate::kprint::_klog_impl($level, "root", format_args!($($arg)+));
    }};
}

/// Error level log (always shown unless logging is off)
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)+) => {
        $crate::klog!($crate::kprint::LogLevel::Error, $($arg)+)
    };
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)+) => {
        $crate::klog!($crate::kprint::LogLevel::Warn, $($arg)+)
    };
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)+) => {
        $crate::klog!($crate::kprint::LogLevel::Info, $($arg)+)
    };
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)+) => {
        $crate::klog!($crate::kprint::LogLevel::Debug, $($arg)+)
    };
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)+) => {
        $crate::klog!($crate::kprint::LogLevel::Trace, $($arg)+)
    };
}

/// Log with a backtrace and abort the process
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)+) => {
        $crate::kprint::_kfatal_impl(format_args!($($arg)+))
    };
}

/// Abort the process if an internal invariant does not hold
#[macro_export]
macro_rules! kassert {
    ($cond:expr $(,)?) => {{
        if !$cond {
            $crate::kprint::_kfatal_impl(format_args!(
                "assertion failed: {}",
                stringify!($cond)
            ));
        }
    }};
    ($cond:expr, $($arg:tt)+) => {{
        if !$cond {
            $crate::kprint::_kfatal_impl(format_args!(
                "assertion failed: {}: {}",
                stringify!($cond),
                format_args!($($arg)+)
            ));
        }
    }};
}

// ============================================================================
// Tests
// ============================================================================
