//! Thread-local runtime state
//!
//! One cell per concern: the running fiber, the thread's root fiber, the
//! scheduler main fiber, the current scheduler and the hook flag. Every
//! other "who am I" lookup in the runtime is derived from these.
//!
//! Accessors are `#[inline(never)]`: a fiber can suspend on one thread and
//! resume on another, so a thread-local address must never be cached across
//! a context switch.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

thread_local! {
    /// Fiber currently executing on this thread (non-owning)
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// The thread's root fiber, created lazily
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber that scheduled tasks switch back to (non-owning)
    static MAIN_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Scheduler driving this thread
    static CURRENT_SCHEDULER: RefCell<Option<Weak<dyn Scheduler>>> = const { RefCell::new(None) };

    /// Whether hooked calls take the cooperative path
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline(never)]
pub fn current_fiber() -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

#[inline(never)]
pub fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(fiber));
}

/// Clear the current pointer if it still names `fiber`
#[inline(never)]
pub fn clear_current_fiber_if(fiber: *const Fiber) {
    let _ = CURRENT_FIBER.try_with(|cell| {
        if cell.get() == fiber {
            cell.set(std::ptr::null());
        }
    });
}

#[inline(never)]
pub fn root_fiber() -> Option<Arc<Fiber>> {
    ROOT_FIBER.with(|cell| cell.borrow().clone())
}

#[inline(never)]
pub fn root_fiber_ptr() -> *const Fiber {
    ROOT_FIBER.with(|cell| match cell.borrow().as_ref() {
        Some(root) => Arc::as_ptr(root),
        None => std::ptr::null(),
    })
}

#[inline(never)]
pub fn set_root_fiber(fiber: Arc<Fiber>) {
    ROOT_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

#[inline(never)]
pub fn main_fiber() -> *const Fiber {
    MAIN_FIBER.with(|cell| cell.get())
}

#[inline(never)]
pub fn set_main_fiber(fiber: *const Fiber) {
    MAIN_FIBER.with(|cell| cell.set(fiber));
}

#[inline(never)]
pub fn current_scheduler() -> Option<Arc<dyn Scheduler>> {
    CURRENT_SCHEDULER
        .try_with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
        .ok()
        .flatten()
}

/// True if a scheduler was registered on this thread, even if it is gone
#[inline(never)]
pub fn has_scheduler() -> bool {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().is_some())
}

#[inline(never)]
pub fn set_current_scheduler(sched: Option<Weak<dyn Scheduler>>) {
    CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = sched);
}

#[inline(never)]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

#[inline(never)]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|cell| cell.set(enabled));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_flag_is_per_thread() {
        set_hook_enabled(true);
        assert!(hook_enabled());
        let other = std::thread::spawn(hook_enabled).join().unwrap();
        assert!(!other);
        set_hook_enabled(false);
    }

    #[test]
    fn test_fresh_thread_state() {
        std::thread::spawn(|| {
            assert!(current_fiber().is_null());
            assert!(main_fiber().is_null());
            assert!(root_fiber().is_none());
            assert!(current_scheduler().is_none());
            assert!(!has_scheduler());
        })
        .join()
        .unwrap();
    }
}
