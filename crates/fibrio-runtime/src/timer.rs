//! Deadline-ordered timers
//!
//! `TimerManager` keeps its timers in a `BTreeMap` keyed by
//! `(next, id)`: earliest deadline first, creation order breaking ties.
//! A timer is in the map iff it still has a callback.
//!
//! Lock order: the manager's set lock, then a timer's own lock.
//!
//! Time is wall-clock milliseconds (`current_ms`). If the clock jumps back
//! by more than an hour, the next `list_expired_callbacks` treats every
//! timer as expired.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fibrio_core::constants::{CLOCK_ROLLOVER_MS, NO_TIMEOUT};
use fibrio_core::{current_ms, kwarn};
use parking_lot::{Mutex, RwLock};

/// Timer callback; recurring timers run it many times
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type Key = (u64, u64);

struct TimerInner {
    next: u64,
    ms: u64,
    cb: Option<TimerCallback>,
}

pub struct Timer {
    id: u64,
    recurring: bool,
    inner: Mutex<TimerInner>,
    manager: Weak<TimerShared>,
}

impl Timer {
    #[inline]
    fn key(&self, inner: &TimerInner) -> Key {
        (inner.next, self.id)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Absolute deadline in ms
    pub fn next(&self) -> u64 {
        self.inner.lock().next
    }

    /// Interval in ms
    pub fn interval(&self) -> u64 {
        self.inner.lock().ms
    }

    /// Still armed (not fired-once, not cancelled)
    pub fn is_armed(&self) -> bool {
        self.inner.lock().cb.is_some()
    }

    /// Disarm and remove. False if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.set.write();
        let mut inner = self.inner.lock();
        if inner.cb.take().is_none() {
            return false;
        }
        set.timers.remove(&self.key(&inner));
        true
    }

    /// Push the deadline to `now + interval`
    pub fn refresh(&self) -> bool {
        self.refresh_at(current_ms())
    }

    fn refresh_at(&self, now: u64) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.set.write();
        let mut inner = self.inner.lock();
        if inner.cb.is_none() {
            return false;
        }
        let Some(timer) = set.timers.remove(&self.key(&inner)) else {
            return false;
        };
        inner.next = now.saturating_add(inner.ms);
        set.timers.insert(self.key(&inner), timer);
        true
    }

    /// Change the interval.
    ///
    /// With `from_now` the new deadline is `now + ms`; otherwise it keeps
    /// the original start point.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        self.reset_at(ms, from_now, current_ms())
    }

    fn reset_at(&self, ms: u64, from_now: bool, now: u64) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let notify = {
            let mut set = shared.set.write();
            let mut inner = self.inner.lock();
            if ms == inner.ms && !from_now {
                return true;
            }
            if inner.cb.is_none() {
                return false;
            }
            let Some(timer) = set.timers.remove(&self.key(&inner)) else {
                return false;
            };
            let start = if from_now {
                now
            } else {
                inner.next.saturating_sub(inner.ms)
            };
            inner.ms = ms;
            inner.next = start.saturating_add(ms);
            let key = self.key(&inner);
            drop(inner);
            shared.insert_locked(&mut set, key, timer)
        };
        if notify {
            shared.notify_front();
        }
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("next", &inner.next)
            .field("ms", &inner.ms)
            .field("recurring", &self.recurring)
            .field("armed", &inner.cb.is_some())
            .finish()
    }
}

struct TimerSet {
    timers: BTreeMap<Key, Arc<Timer>>,
    previous: u64,
}

struct TimerShared {
    set: RwLock<TimerSet>,
    /// Front-insert already signalled and not yet consumed by `next_timer`
    tickled: AtomicBool,
    on_front: Option<Box<dyn Fn() + Send + Sync>>,
}

impl TimerShared {
    /// Insert under the set lock; true if the owner should be notified
    fn insert_locked(&self, set: &mut TimerSet, key: Key, timer: Arc<Timer>) -> bool {
        set.timers.insert(key, timer);
        let at_front = set.timers.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify_front(&self) {
        if let Some(cb) = &self.on_front {
            cb();
        }
    }
}

/// Owner of a deadline-ordered timer set
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self::build(None, current_ms())
    }

    /// `on_front` runs when a timer becomes the earliest one, at most once
    /// between two `next_timer` calls.
    pub fn with_front_notifier<F>(on_front: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(on_front)), current_ms())
    }

    fn build(on_front: Option<Box<dyn Fn() + Send + Sync>>, now: u64) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous: now,
                }),
                tickled: AtomicBool::new(false),
                on_front,
            }),
        }
    }

    /// Fire `cb` after `ms`, and every `ms` after that if `recurring`
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_at(ms, Arc::new(cb), recurring, current_ms())
    }

    /// Like `add_timer`, but `cb` only runs while `cond` can be upgraded
    pub fn add_condition_timer<F, W>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<W>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        W: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn add_timer_at(&self, ms: u64, cb: TimerCallback, recurring: bool, now: u64) -> Arc<Timer> {
        let next = now.saturating_add(ms);
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            inner: Mutex::new(TimerInner {
                next,
                ms,
                cb: Some(cb),
            }),
            manager: Arc::downgrade(&self.shared),
        });

        let notify = {
            let mut set = self.shared.set.write();
            self.shared
                .insert_locked(&mut set, (next, timer.id), timer.clone())
        };
        if notify {
            self.shared.notify_front();
        }
        timer
    }

    /// Milliseconds until the earliest deadline: 0 if overdue, `u64::MAX` if none
    pub fn next_timer(&self) -> u64 {
        self.next_timer_at(current_ms())
    }

    fn next_timer_at(&self, now: u64) -> u64 {
        self.shared.tickled.store(false, Ordering::Release);
        let set = self.shared.set.read();
        match set.timers.keys().next() {
            None => NO_TIMEOUT,
            Some(&(next, _)) if next <= now => 0,
            Some(&(next, _)) => next - now,
        }
    }

    /// Remove every due timer and return their callbacks in deadline order.
    ///
    /// Recurring timers are re-armed at `now + interval`.
    pub fn list_expired_callbacks(&self) -> Vec<TimerCallback> {
        self.list_expired_callbacks_at(current_ms())
    }

    fn list_expired_callbacks_at(&self, now: u64) -> Vec<TimerCallback> {
        if self.shared.set.read().timers.is_empty() {
            return Vec::new();
        }

        let mut set = self.shared.set.write();
        let rollover = detect_clock_rollover(&mut set, now);
        if rollover {
            kwarn!(target: "system", "clock rolled back, expiring {} timers", set.timers.len());
        }

        let expired = if rollover {
            std::mem::take(&mut set.timers)
        } else {
            match set.timers.keys().next() {
                Some(&(next, _)) if next <= now => {}
                _ => return Vec::new(),
            }
            let rest = set.timers.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut set.timers, rest)
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for timer in expired.into_values() {
            let mut inner = timer.inner.lock();
            let Some(cb) = inner.cb.clone() else {
                continue;
            };
            cbs.push(cb);
            if timer.recurring {
                inner.next = now.saturating_add(inner.ms);
                let key = timer.key(&inner);
                drop(inner);
                set.timers.insert(key, timer);
            } else {
                inner.cb = None;
            }
        }
        cbs
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.set.read().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

fn detect_clock_rollover(set: &mut TimerSet, now: u64) -> bool {
    let rollover =
        now < set.previous && now < set.previous.saturating_sub(CLOCK_ROLLOVER_MS);
    set.previous = now;
    rollover
}
