//! Fiber stacks
//!
//! Each stack is its own anonymous mapping with a `PROT_NONE` guard page at
//! the low end, so an overflow faults instead of silently corrupting the
//! neighbouring allocation.

use fibrio_core::constants::{GUARD_SIZE, MIN_STACK_SIZE};
use fibrio_core::error::StackError;
use nix::errno::Errno;

/// An owned, guarded stack region
pub struct Stack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

// The mapping is owned exclusively and only touched by the fiber running on it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> Result<Self, StackError> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::TooSmall(size));
        }

        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let guard = GUARD_SIZE.max(page);
        let total = usable + guard;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocationFailed(Errno::last_raw()));
        }

        // Stacks grow down: the guard sits at the lowest address.
        let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
        if ret != 0 {
            let errno = Errno::last_raw();
            unsafe { libc::munmap(base, total) };
            return Err(StackError::ProtectionFailed(errno));
        }

        Ok(Self {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// One past the highest usable address
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes, excluding the guard page
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if ret != 0 {
            fibrio_core::kerror!(
                target: "system",
                "munmap of fiber stack failed: {}",
                Errno::last()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alloc() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);
        assert_eq!(stack.top() as usize % page_size(), 0);

        // Top of the usable region is writable.
        unsafe {
            let p = stack.top().sub(8);
            p.write_volatile(0xAB);
            assert_eq!(p.read_volatile(), 0xAB);
        }
    }

    #[test]
    fn test_stack_rounds_to_pages() {
        let stack = Stack::new(MIN_STACK_SIZE + 1).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() > MIN_STACK_SIZE);
    }

    #[test]
    fn test_stack_too_small() {
        assert!(matches!(Stack::new(1024), Err(StackError::TooSmall(1024))));
    }
}
