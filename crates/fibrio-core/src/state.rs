//! Fiber lifecycle states

use core::fmt;

/// State of a fiber
///
/// ```text
/// INIT -> EXEC <-> HOLD / READY -> TERM | EXCEPT
///   ^                                 |
///   +------------- reset() -----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, never switched into
    Init = 0,

    /// Suspended, waiting for something else to reschedule it
    Hold = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Callback returned normally
    Term = 3,

    /// Suspended and immediately runnable again
    Ready = 4,

    /// Callback panicked
    Except = 5,
}

impl FiberState {
    /// Finished, either normally or by panic
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// States from which `reset()` is legal
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            FiberState::Init => "INIT",
            FiberState::Hold => "HOLD",
            FiberState::Exec => "EXEC",
            FiberState::Term => "TERM",
            FiberState::Ready => "READY",
            FiberState::Except => "EXCEPT",
        }
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
