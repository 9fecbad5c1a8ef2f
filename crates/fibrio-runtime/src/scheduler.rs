//! N:M task scheduler
//!
//! A scheduler owns a FIFO of tasks (a fiber, or a callback that gets a
//! fiber of its own) and a set of worker threads that each run the
//! dispatch loop in `run`. Concrete schedulers provide three capabilities
//! through the `Scheduler` trait: how to wake an idle worker (`tickle`),
//! what to do when there is no work (`idle`) and when it is safe to stop
//! (`stopping`). The queue and thread machinery is shared in
//! `SchedulerBase`.
//!
//! With `use_caller`, the constructing thread is worker 0: its share of
//! the dispatch loop runs in a dedicated root fiber, entered from `stop()`.
//!
//! ```text
//!            schedule()            +--------------------------+
//!  task ---> [ VecDeque<Task> ] -->| run(): pick, call(), ... |  x N workers
//!                                  |   nothing to do: idle()  |
//!                                  +--------------------------+
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use fibrio_core::error::SchedResult;
use fibrio_core::{kassert, kdebug, kinfo, thread_id, FiberState, ThreadId};
use parking_lot::Mutex;

use crate::fiber::{Fiber, FiberFn};
use crate::iomanager::IoManager;
use crate::tls;
use crate::worker::{self, WorkerPool};

/// What a task runs
pub enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// Unit of work: a fiber or a callback, optionally pinned to one thread
pub struct Task {
    kind: TaskKind,
    thread: Option<ThreadId>,
}

impl Task {
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Self {
            kind: TaskKind::Fiber(fiber),
            thread: None,
        }
    }

    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::boxed(Box::new(f))
    }

    pub fn boxed(cb: FiberFn) -> Self {
        Self {
            kind: TaskKind::Call(cb),
            thread: None,
        }
    }

    /// Only the worker with this kernel thread id may run the task
    pub fn on_thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Task");
        match &self.kind {
            TaskKind::Fiber(fiber) => d.field("fiber", &fiber.id()),
            TaskKind::Call(_) => d.field("call", &".."),
        };
        d.field("thread", &self.thread).finish()
    }
}

/// Capabilities a concrete scheduler supplies to the shared dispatch loop
pub trait Scheduler: Send + Sync + 'static {
    fn base(&self) -> &SchedulerBase;

    /// Wake an idle worker
    fn tickle(&self);

    /// True once the scheduler may shut down
    fn stopping(&self) -> bool;

    /// Body of each worker's idle fiber
    fn idle(&self);

    fn as_io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        None
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn schedule(&self, task: Task) {
        if self.base().push(task) {
            self.tickle();
        }
    }

    fn schedule_batch(&self, tasks: Vec<Task>) {
        if self.base().push_batch(tasks) {
            self.tickle();
        }
    }

    fn has_idle_threads(&self) -> bool {
        self.base().idle_count() > 0
    }
}

/// Queue, threads and counters shared by every scheduler
pub struct SchedulerBase {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    workers: Mutex<WorkerPool>,
    thread_ids: Mutex<Vec<ThreadId>>,
    /// Threads to spawn; excludes the caller thread
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    root_thread: Option<ThreadId>,
    root_fiber: Option<Arc<Fiber>>,
}

impl SchedulerBase {
    /// `this` is the owning scheduler, usually from `Arc::new_cyclic`.
    pub fn new(threads: usize, use_caller: bool, name: &str, this: Weak<dyn Scheduler>) -> Self {
        kassert!(threads > 0, "scheduler {} needs at least one thread", name);
        crate::init();

        let mut thread_count = threads;
        let mut thread_ids = Vec::with_capacity(threads);
        let mut root_thread = None;
        let mut root_fiber = None;

        if use_caller {
            let _ = Fiber::current();
            thread_count -= 1;

            kassert!(
                tls::current_scheduler().is_none(),
                "thread already runs a scheduler"
            );
            tls::set_current_scheduler(Some(this.clone()));

            let fiber = Fiber::new(
                move || {
                    if let Some(sched) = this.upgrade() {
                        run(sched);
                    }
                },
                0,
                false,
            );
            tls::set_main_fiber(Arc::as_ptr(&fiber));

            let tid = thread_id();
            thread_ids.push(tid);
            root_thread = Some(tid);
            root_fiber = Some(fiber);
        }

        Self {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            workers: Mutex::new(WorkerPool::new()),
            thread_ids: Mutex::new(thread_ids),
            thread_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_thread,
            root_fiber,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append; true if the queue was empty
    fn push(&self, task: Task) -> bool {
        let mut tasks = self.tasks.lock();
        let was_empty = tasks.is_empty();
        tasks.push_back(task);
        was_empty
    }

    fn push_batch(&self, batch: Vec<Task>) -> bool {
        if batch.is_empty() {
            return false;
        }
        let mut tasks = self.tasks.lock();
        let was_empty = tasks.is_empty();
        tasks.extend(batch);
        was_empty
    }

    /// `stop()` was called and all queued work has drained
    pub fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.tasks.lock().is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Kernel thread ids of all workers, the caller thread first if used
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_ids.lock().clone()
    }

    pub fn root_thread(&self) -> Option<ThreadId> {
        self.root_thread
    }

    /// Total worker threads, the caller included
    pub fn size(&self) -> usize {
        self.thread_count + usize::from(self.root_thread.is_some())
    }

    pub fn is_running(&self) -> bool {
        !self.stopping.load(Ordering::Acquire)
    }
}

impl Drop for SchedulerBase {
    fn drop(&mut self) {
        if let Some(root) = &self.root_fiber {
            if tls::main_fiber() == Arc::as_ptr(root) {
                tls::set_main_fiber(std::ptr::null());
            }
        }
    }
}

impl fmt::Display for SchedulerBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Scheduler name={} size={} active_count={} idle_count={} stopping={} ]",
            self.name,
            self.size(),
            self.active_count(),
            self.idle_count(),
            self.stopping.load(Ordering::Relaxed),
        )?;
        let ids = self.thread_ids.lock();
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        write!(f, "\n    {}", ids.join(", "))
    }
}

/// Scheduler registered on the calling thread
pub fn this() -> Option<Arc<dyn Scheduler>> {
    tls::current_scheduler()
}

/// Fiber that scheduled tasks on this thread switch back to
///
/// Only meaningful from inside a running scheduler.
pub fn main_fiber() -> Option<Arc<Fiber>> {
    let ptr = tls::main_fiber();
    if ptr.is_null() {
        return None;
    }
    unsafe {
        Arc::increment_strong_count(ptr);
        Some(Arc::from_raw(ptr))
    }
}

/// Spawn the worker threads. No-op if already running.
pub fn start(sched: &Arc<dyn Scheduler>) -> SchedResult<()> {
    let base = sched.base();
    let mut pool = base.workers.lock();
    if !base.stopping.load(Ordering::Acquire) {
        return Ok(());
    }
    base.stopping.store(false, Ordering::Release);
    kassert!(pool.is_empty(), "scheduler {} restarted with live workers", base.name);

    for i in 0..base.thread_count {
        let s = sched.clone();
        let tid = pool.spawn(format!("{}_{}", base.name, i), move || run(s))?;
        base.thread_ids.lock().push(tid);
    }
    kinfo!(target: "system", "{} started, {} threads", base.name, base.size());
    Ok(())
}

/// Request shutdown, drain the queue and join the workers.
///
/// A `use_caller` scheduler must be stopped from its constructing thread
/// (which then runs its share of the remaining work); any other scheduler
/// must be stopped from outside its own workers.
pub fn stop(sched: &Arc<dyn Scheduler>) {
    let base = sched.base();
    base.auto_stop.store(true, Ordering::Release);

    if let Some(root) = &base.root_fiber {
        if base.thread_count == 0
            && matches!(root.state(), FiberState::Term | FiberState::Init)
        {
            base.stopping.store(true, Ordering::Release);
            if sched.stopping() {
                release_caller(base);
                kinfo!(target: "system", "{} stopped", base.name);
                return;
            }
        }
    }

    let on_own_thread = tls::current_scheduler()
        .is_some_and(|cur| std::ptr::eq(cur.base(), base));
    if base.root_thread.is_some() {
        kassert!(on_own_thread, "{} must be stopped from its caller thread", base.name);
    } else {
        kassert!(!on_own_thread, "{} stopped from one of its own workers", base.name);
    }

    base.stopping.store(true, Ordering::Release);
    for _ in 0..base.thread_count {
        sched.tickle();
    }
    if base.root_fiber.is_some() {
        sched.tickle();
    }

    if let Some(root) = &base.root_fiber {
        if !sched.stopping() && !root.state().is_terminal() {
            root.call();
        }
    }

    let handles = base.workers.lock().take();
    worker::join_all(handles);

    release_caller(base);
    kinfo!(target: "system", "{} stopped", base.name);
}

/// Unregister a stopped `use_caller` scheduler from its caller thread
fn release_caller(base: &SchedulerBase) {
    if base.root_thread == Some(thread_id()) {
        tls::set_main_fiber(std::ptr::null());
        tls::set_current_scheduler(None);
    }
}

/// Move the current fiber onto `target` (optionally a specific thread of it)
pub fn switch_to(target: &Arc<dyn Scheduler>, thread: Option<ThreadId>) {
    if let Some(cur) = this() {
        let here = thread.is_none_or(|t| t == thread_id());
        if std::ptr::eq(cur.base(), target.base()) && here {
            return;
        }
    }

    let mut task = Task::fiber(Fiber::current());
    if let Some(t) = thread {
        task = task.on_thread(t);
    }
    target.schedule(task);
    Fiber::yield_to_hold();
}

/// Dispatch loop of one worker thread
pub fn run(sched: Arc<dyn Scheduler>) {
    let base = sched.base();
    let me = thread_id();
    kdebug!(target: "system", "{} run", base.name);

    tls::set_hook_enabled(true);
    tls::set_current_scheduler(Some(Arc::downgrade(&sched)));
    if base.root_thread != Some(me) {
        let root = Fiber::current();
        tls::set_main_fiber(Arc::as_ptr(&root));
    }

    let weak = Arc::downgrade(&sched);
    let idle_fiber = Fiber::new(
        move || {
            if let Some(s) = weak.upgrade() {
                s.idle();
            }
        },
        0,
        true,
    );
    let mut task_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut tickle_me = false;
        let task = {
            let mut tasks = base.tasks.lock();
            let mut found = None;
            let mut i = 0;
            while i < tasks.len() {
                let task = &tasks[i];
                if task.thread.is_some_and(|t| t != me) {
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                if let TaskKind::Fiber(f) = &task.kind {
                    if f.state() == FiberState::Exec {
                        i += 1;
                        continue;
                    }
                }
                found = tasks.remove(i);
                base.active.fetch_add(1, Ordering::AcqRel);
                break;
            }
            tickle_me |= i < tasks.len();
            found
        };

        if tickle_me {
            sched.tickle();
        }

        match task.map(|t| t.kind) {
            Some(TaskKind::Fiber(fiber)) if !fiber.state().is_terminal() => {
                fiber.set_join_scheduler(true);
                fiber.call();
                base.active.fetch_sub(1, Ordering::AcqRel);

                match fiber.state() {
                    FiberState::Ready => sched.schedule(Task::fiber(fiber)),
                    s if !s.is_terminal() => fiber.set_state(FiberState::Hold),
                    _ => {}
                }
            }
            Some(TaskKind::Fiber(_)) => {
                base.active.fetch_sub(1, Ordering::AcqRel);
            }
            Some(TaskKind::Call(cb)) => {
                let fiber = match task_fiber.take() {
                    Some(f) => {
                        f.reset_boxed(cb, true);
                        f
                    }
                    None => Fiber::new(cb, 0, true),
                };
                fiber.call();
                base.active.fetch_sub(1, Ordering::AcqRel);

                match fiber.state() {
                    FiberState::Ready => sched.schedule(Task::fiber(fiber)),
                    s if s.is_terminal() => task_fiber = Some(fiber),
                    _ => fiber.set_state(FiberState::Hold),
                }
            }
            None => {
                if idle_fiber.state().is_terminal() {
                    kdebug!(target: "system", "{} idle fiber finished", base.name);
                    break;
                }
                base.idle.fetch_add(1, Ordering::AcqRel);
                idle_fiber.call();
                base.idle.fetch_sub(1, Ordering::AcqRel);
                if !idle_fiber.state().is_terminal() {
                    idle_fiber.set_state(FiberState::Hold);
                }
            }
        }
    }

    tls::set_hook_enabled(false);
}

/// Scheduler whose idle workers spin on `yield`
///
/// Has no way to wake a worker, so `tickle` only logs.
pub struct BasicScheduler {
    base: SchedulerBase,
}

impl BasicScheduler {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<BasicScheduler>| {
            let this: Weak<dyn Scheduler> = weak.clone();
            BasicScheduler {
                base: SchedulerBase::new(threads, use_caller, name, this),
            }
        })
    }

    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        let sched: Arc<dyn Scheduler> = self.clone();
        start(&sched)
    }

    pub fn stop(self: &Arc<Self>) {
        let sched: Arc<dyn Scheduler> = self.clone();
        stop(&sched);
    }
}

impl Scheduler for BasicScheduler {
    fn base(&self) -> &SchedulerBase {
        &self.base
    }

    fn tickle(&self) {
        kdebug!(target: "system", "{} tickle", self.base.name);
    }

    fn stopping(&self) -> bool {
        self.base.base_stopping()
    }

    fn idle(&self) {
        kdebug!(target: "system", "{} idle", self.base.name);
        while !self.stopping() {
            std::thread::yield_now();
            Fiber::yield_to_hold();
        }
    }
}

impl fmt::Display for BasicScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base, f)
    }
}
