//! Stackful fibers
//!
//! A `Fiber` is a callback plus its own stack and saved register file.
//! Control moves with a symmetric pair:
//!
//! - `call()` switches from the thread's root fiber (or the scheduler main
//!   fiber, for fibers that join a scheduler) into this fiber.
//! - `back()` switches from this fiber to wherever it was entered from.
//!
//! ```text
//!  INIT --call--> EXEC --yield_to_ready--> READY --call--> EXEC
//!                   |  --yield_to_hold---> HOLD  --call--> EXEC
//!                   +--return--> TERM     panic--> EXCEPT
//!  TERM | EXCEPT | INIT --reset--> INIT
//! ```
//!
//! Each thread lazily gets a stackless root fiber representing its original
//! call stack. Exactly one fiber per thread is current at any instant.
//!
//! Ownership: the runtime (task queue, run loop, event contexts) holds the
//! `Arc`s. The trampoline itself keeps only a raw pointer, so a finished
//! fiber is freed as soon as the last runtime handle is dropped.

use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use fibrio_core::error::{FiberFailure, SchedResult};
use fibrio_core::util::backtrace_string;
use fibrio_core::{kassert, kdebug, kerror, kfatal, FiberId, FiberState};
use parking_lot::Mutex;

use crate::arch::{self, Context};
use crate::config;
use crate::stack::Stack;
use crate::tls;

/// Fiber body
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Live fibers, root fibers included
static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    join_scheduler: AtomicBool,
    ctx: UnsafeCell<Context>,
    stack: Option<Stack>,
    cb: UnsafeCell<Option<FiberFn>>,
    failure: Mutex<Option<FiberFailure>>,
}

// `ctx` and `cb` are only touched by the thread that is switching into or
// out of the fiber, and the run loop never lets two threads do that at once.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber in INIT state.
    ///
    /// `stack_size == 0` uses the `fiber.stack_size` config value. Aborts if
    /// the stack cannot be mapped; use `try_new` to handle that instead.
    pub fn new<F>(cb: F, stack_size: usize, join_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        match Self::try_new(cb, stack_size, join_scheduler) {
            Ok(fiber) => fiber,
            Err(e) => kfatal!("fiber creation failed: {}", e),
        }
    }

    pub fn try_new<F>(cb: F, stack_size: usize, join_scheduler: bool) -> SchedResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::fiber_stack_size().get_value() as usize
        } else {
            stack_size
        };
        let stack = Stack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            join_scheduler: AtomicBool::new(join_scheduler),
            ctx: UnsafeCell::new(Context::default()),
            stack: Some(stack),
            cb: UnsafeCell::new(Some(Box::new(cb))),
            failure: Mutex::new(None),
        });
        fiber.arm();
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        kdebug!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    /// Stackless fiber standing for a thread's original stack
    fn new_root() -> Fiber {
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: FiberId::ROOT,
            state: AtomicU8::new(FiberState::Exec as u8),
            join_scheduler: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::default()),
            stack: None,
            cb: UnsafeCell::new(None),
            failure: Mutex::new(None),
        }
    }

    fn arm(&self) {
        let Some(stack) = &self.stack else {
            kfatal!("fiber {} has no stack to arm", self.id);
        };
        unsafe {
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_main,
                self as *const Fiber as usize,
            );
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn join_scheduler(&self) -> bool {
        self.join_scheduler.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_join_scheduler(&self, join: bool) {
        self.join_scheduler.store(join, Ordering::Relaxed);
    }

    /// Usable stack bytes, 0 for a root fiber
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    /// Panic captured by the trampoline, if the fiber ended in EXCEPT
    pub fn failure(&self) -> Option<FiberFailure> {
        self.failure.lock().clone()
    }

    /// Re-arm a finished (or never started) fiber with a new callback.
    ///
    /// Reuses the existing stack.
    pub fn reset<F>(&self, cb: F, join_scheduler: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(cb), join_scheduler);
    }

    pub(crate) fn reset_boxed(&self, cb: FiberFn, join_scheduler: bool) {
        kassert!(self.stack.is_some(), "reset of root fiber");
        let state = self.state();
        kassert!(state.is_resettable(), "reset of fiber {} in {}", self.id, state);

        unsafe { *self.cb.get() = Some(cb) };
        *self.failure.lock() = None;
        self.set_join_scheduler(join_scheduler);
        self.arm();
        self.set_state(FiberState::Init);
    }

    /// Fiber this one switches with
    fn peer(&self) -> *const Fiber {
        let peer = if self.join_scheduler() {
            tls::main_fiber()
        } else {
            ensure_root();
            tls::root_fiber_ptr()
        };
        kassert!(!peer.is_null(), "fiber {} has no fiber to switch with", self.id);
        peer
    }

    /// Switch from the root or scheduler main fiber into this fiber.
    ///
    /// Returns when this fiber calls `back()`.
    pub fn call(&self) {
        let from = self.peer();
        kassert!(
            !std::ptr::eq(from, self),
            "fiber {} switching into itself",
            self.id
        );
        let state = self.state();
        kassert!(
            !state.is_terminal() && state != FiberState::Exec,
            "call into fiber {} in {}",
            self.id,
            state
        );

        tls::set_current_fiber(self);
        self.set_state(FiberState::Exec);
        unsafe { arch::switch_context((*from).ctx.get(), self.ctx.get()) };
    }

    /// Switch from this fiber back to the fiber it was entered from
    pub fn back(&self) {
        let to = self.peer();
        tls::set_current_fiber(to);
        unsafe { arch::switch_context(self.ctx.get(), (*to).ctx.get()) };
    }

    /// The running fiber, creating the thread's root fiber on first use
    pub fn current() -> Arc<Fiber> {
        let ptr = tls::current_fiber();
        if !ptr.is_null() {
            // The runtime keeps every running fiber alive.
            unsafe {
                Arc::increment_strong_count(ptr);
                return Arc::from_raw(ptr);
            }
        }

        let root = Arc::new(Fiber::new_root());
        kassert!(tls::root_fiber().is_none(), "root fiber exists but is not current");
        tls::set_current_fiber(Arc::as_ptr(&root));
        tls::set_root_fiber(root.clone());
        root
    }

    /// Id of the running fiber, 0 if none has been created on this thread
    pub fn current_id() -> FiberId {
        let ptr = tls::current_fiber();
        if ptr.is_null() {
            FiberId::ROOT
        } else {
            unsafe { (*ptr).id }
        }
    }

    /// Yield, leaving the fiber runnable
    pub fn yield_to_ready() {
        let cur = Self::current_for_yield();
        cur.set_state(FiberState::Ready);
        cur.back();
    }

    /// Yield; the run loop marks the fiber HOLD once it is off this stack
    pub fn yield_to_hold() {
        let cur = Self::current_for_yield();
        cur.back();
    }

    fn current_for_yield() -> Arc<Fiber> {
        let cur = Fiber::current();
        kassert!(!cur.is_root(), "yield from a root fiber");
        kassert!(
            cur.state() == FiberState::Exec,
            "yield from fiber {} in {}",
            cur.id,
            cur.state()
        );
        cur
    }

    /// Number of live fibers in the process
    pub fn total_fibers() -> u64 {
        TOTAL_FIBERS.load(Ordering::Relaxed)
    }
}

fn ensure_root() {
    if tls::root_fiber_ptr().is_null() {
        let _ = Fiber::current();
    }
}

/// Entry point of every stackful fiber
extern "C" fn fiber_main(arg: usize) {
    let raw = arg as *const Fiber;
    {
        let fiber = unsafe { &*raw };
        let cb = unsafe { (*fiber.cb.get()).take() };
        let outcome = match cb {
            Some(cb) => catch_unwind(AssertUnwindSafe(cb)),
            None => Ok(()),
        };

        match outcome {
            Ok(()) => fiber.set_state(FiberState::Term),
            Err(payload) => {
                let failure = FiberFailure::from_panic(fiber.id, payload.as_ref(), backtrace_string());
                kerror!(target: "system", "{}\n{}", failure, failure.backtrace);
                *fiber.failure.lock() = Some(failure);
                fiber.set_state(FiberState::Except);
            }
        }
        // payload and callback captures are dropped here, on this stack
    }

    unsafe { (*raw).back() };
    kfatal!("fiber {} resumed after termination", unsafe { (*raw).id });
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL_FIBERS.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if self.stack.is_some() {
            kassert!(
                state.is_resettable(),
                "fiber {} dropped in {}",
                self.id,
                state
            );
        } else {
            kassert!(state == FiberState::Exec, "root fiber dropped in {}", state);
            kassert!(unsafe { (*self.cb.get()).is_none() }, "root fiber has a callback");
            tls::clear_current_fiber_if(self);
        }
        kdebug!("fiber {} freed", self.id);
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("join_scheduler", &self.join_scheduler())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn on_fresh_thread<F: FnOnce() + Send + 'static>(f: F) {
        std::thread::spawn(f).join().unwrap();
    }

    #[test]
    fn test_root_fiber_is_lazy() {
        on_fresh_thread(|| {
            assert_eq!(Fiber::current_id(), FiberId::ROOT);
            let root = Fiber::current();
            assert!(root.is_root());
            assert_eq!(root.state(), FiberState::Exec);
            assert!(Arc::ptr_eq(&root, &Fiber::current()));
        });
    }

    #[test]
    fn test_call_runs_to_term() {
        on_fresh_thread(|| {
            let hits = Arc::new(AtomicUsize::new(0));
            let h = hits.clone();
            let fiber = Fiber::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }, 0, false);

            assert_eq!(fiber.state(), FiberState::Init);
            assert!(fiber.id().as_u64() >= 1);
            fiber.call();

            assert_eq!(hits.load(Ordering::SeqCst), 1);
            assert_eq!(fiber.state(), FiberState::Term);
            assert_eq!(Fiber::current_id(), FiberId::ROOT);
        });
    }

    #[test]
    fn test_yield_and_resume() {
        on_fresh_thread(|| {
            let steps = Arc::new(Mutex::new(Vec::new()));
            let s = steps.clone();
            let fiber = Fiber::new(move || {
                s.lock().push(1);
                Fiber::yield_to_ready();
                s.lock().push(3);
                Fiber::yield_to_hold();
                s.lock().push(5);
            }, 0, false);

            fiber.call();
            assert_eq!(fiber.state(), FiberState::Ready);
            steps.lock().push(2);

            fiber.call();
            // yield_to_hold leaves the state to the caller
            assert_eq!(fiber.state(), FiberState::Exec);
            fiber.set_state(FiberState::Hold);
            steps.lock().push(4);

            fiber.call();
            assert_eq!(fiber.state(), FiberState::Term);
            assert_eq!(*steps.lock(), vec![1, 2, 3, 4, 5]);
        });
    }

    #[test]
    fn test_panic_becomes_except() {
        on_fresh_thread(|| {
            let fiber = Fiber::new(|| panic!("fiber blew up"), 0, false);
            fiber.call();

            assert_eq!(fiber.state(), FiberState::Except);
            let failure = fiber.failure().unwrap();
            assert_eq!(failure.fiber_id, fiber.id());
            assert_eq!(failure.message, "fiber blew up");
        });
    }

    #[test]
    fn test_reset_reuses_stack() {
        on_fresh_thread(|| {
            let fiber = Fiber::new(|| panic!("first"), 64 * 1024, false);
            fiber.call();
            assert_eq!(fiber.state(), FiberState::Except);
            let top = fiber.stack.as_ref().unwrap().top();

            let ran = Arc::new(AtomicBool::new(false));
            let r = ran.clone();
            fiber.reset(move || r.store(true, Ordering::SeqCst), false);
            assert_eq!(fiber.state(), FiberState::Init);
            assert!(fiber.failure().is_none());
            assert_eq!(fiber.stack.as_ref().unwrap().top(), top);

            fiber.call();
            assert!(ran.load(Ordering::SeqCst));
            assert_eq!(fiber.state(), FiberState::Term);
        });
    }

    #[test]
    fn test_captures_dropped_before_back() {
        on_fresh_thread(|| {
            let token = Arc::new(());
            let held = token.clone();
            let fiber = Fiber::new(move || {
                let _keep = held;
            }, 0, false);

            assert_eq!(Arc::strong_count(&token), 2);
            fiber.call();
            assert_eq!(Arc::strong_count(&token), 1);
        });
    }

    #[test]
    fn test_current_inside_fiber() {
        on_fresh_thread(|| {
            let seen = Arc::new(AtomicU64::new(0));
            let s = seen.clone();
            let fiber = Fiber::new(move || {
                s.store(Fiber::current().id().as_u64(), Ordering::SeqCst);
            }, 0, false);
            fiber.call();
            assert_eq!(seen.load(Ordering::SeqCst), fiber.id().as_u64());
        });
    }

    #[test]
    fn test_total_fibers_counts_live() {
        on_fresh_thread(|| {
            let _root = Fiber::current();
            let fiber = Fiber::new(|| {}, 0, false);
            assert!(Fiber::total_fibers() >= 2);
            fiber.call();
        });
    }

    #[test]
    fn test_try_new_reports_small_stack() {
        let err = Fiber::try_new(|| {}, 1024, false).err().unwrap();
        assert!(matches!(err, fibrio_core::SchedError::Stack(_)));
    }
}
