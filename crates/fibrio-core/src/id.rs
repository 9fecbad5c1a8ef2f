//! Fiber identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Last id handed out. The first fiber created gets id 1.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a fiber
///
/// Ids are process-wide and monotonically increasing. The value 0 is
/// reserved for thread root fibers, which are never allocated an id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Id of a thread's root fiber (and "no fiber")
    pub const ROOT: FiberId = FiberId(0);

    /// Allocate the next id from the global counter
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Create a FiberId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the root id
    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for FiberId {
    #[inline]
    fn from(id: u64) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "FiberId(ROOT)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::ROOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_basics() {
        let id = FiberId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert!(!id.is_root());
        assert!(FiberId::ROOT.is_root());
        assert_eq!(FiberId::default(), FiberId::ROOT);
    }

    #[test]
    fn test_fiber_id_next_is_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b > a);
        assert!(!a.is_root());
    }

    #[test]
    fn test_fiber_id_conversions() {
        let id: FiberId = 100u64.into();
        let raw: u64 = id.into();
        assert_eq!(raw, 100);
        assert_eq!(format!("{:?}", FiberId::ROOT), "FiberId(ROOT)");
    }
}
