//! Synchronization primitives shared by the scheduler, the task queue and the renderers.
//!
//! All atomics use sequentially consistent ordering: these values gate cross-thread state
//! transitions (processing/paused/error) rather than hot counters.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if another thread panicked while holding it.
///
/// Handler panics are caught and logged elsewhere; a poisoned lock must not take the
/// render path down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Signed 64-bit counter with full barrier semantics.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicI64);

impl AtomicCounter {
    pub const fn new(value: i64) -> Self {
        Self(AtomicI64::new(value))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::SeqCst);
    }

    /// Returns the incremented value.
    pub fn increment(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the decremented value.
    pub fn decrement(&self) -> i64 {
        self.0.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Add `delta`, saturating at the `i64` bounds. Returns the previous value.
    pub fn fetch_add(&self, delta: i64) -> i64 {
        match self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_add(delta))
            }) {
            Ok(previous) | Err(previous) => previous,
        }
    }
}

/// Boolean with full barrier semantics.
#[derive(Debug, Default)]
pub struct AtomicFlag(AtomicBool);

impl AtomicFlag {
    pub const fn new(value: bool) -> Self {
        Self(AtomicBool::new(value))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    /// Returns the previous value.
    pub fn swap(&self, value: bool) -> bool {
        self.0.swap(value, Ordering::SeqCst)
    }

    /// Store `new` only if the flag currently holds `expected`.
    pub fn compare_and_set(&self, expected: bool, new: bool) -> bool {
        self.0
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Release one permit, waking a single waiter.
    pub fn signal(&self) {
        let mut permits = lock(&self.permits);
        *permits += 1;
        self.available.notify_one();
    }

    /// Block until a permit is available and take it.
    pub fn wait(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Like [`Semaphore::wait`], giving up after `timeout`. Returns `true` if a permit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .available
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
        *permits -= 1;
        true
    }
}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// Mutual exclusion lock that the owning thread may acquire repeatedly.
///
/// Acquisition returns a guard; the lock is released when the outermost guard drops, on every
/// exit path including early returns and unwinding.
#[derive(Debug, Default)]
pub struct ReentrantLock {
    owner: Mutex<Owner>,
    released: Condvar,
}

/// Scoped ownership of a [`ReentrantLock`]. Not `Send`: it must drop on the acquiring thread.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl ReentrantLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> ReentrantGuard<'_> {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    break;
                }
                Some(holder) if holder == me => {
                    owner.depth += 1;
                    break;
                }
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        let mut owner = lock(&self.lock.owner);
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            self.lock.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn counter_increment_and_decrement_return_new_value() {
        let counter = AtomicCounter::new(0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.decrement(), 1);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn counter_fetch_add_saturates() {
        let counter = AtomicCounter::new(i64::MAX - 1);
        assert_eq!(counter.fetch_add(10), i64::MAX - 1);
        assert_eq!(counter.get(), i64::MAX);
    }

    #[test]
    fn flag_compare_and_set_only_once() {
        let flag = AtomicFlag::new(false);
        assert!(flag.compare_and_set(false, true));
        assert!(!flag.compare_and_set(false, true));
        assert!(flag.get());
        assert!(flag.swap(false));
    }

    #[test]
    fn counter_is_consistent_across_threads() {
        let counter = Arc::new(AtomicCounter::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.get(), 4000);
    }

    #[test]
    fn semaphore_wait_blocks_until_signal() {
        let sem = Arc::new(Semaphore::new(0));
        let sem_thread = sem.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sem_thread.signal();
        });
        sem.wait();
        handle.join().unwrap();
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn semaphore_counts_permits() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
        sem.signal();
        assert!(sem.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn semaphore_wait_timeout_expires() {
        let sem = Semaphore::new(0);
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn reentrant_lock_is_released_by_the_outermost_guard() {
        let lock = Arc::new(ReentrantLock::new());
        let acquired = Arc::new(AtomicFlag::new(false));
        let outer = lock.lock();
        let inner = lock.lock();

        let lock_thread = lock.clone();
        let acquired_thread = acquired.clone();
        let handle = thread::spawn(move || {
            let _guard = lock_thread.lock();
            acquired_thread.set(true);
        });

        drop(inner);
        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.get());
        drop(outer);
        handle.join().unwrap();
        assert!(acquired.get());
    }

    #[test]
    fn reentrant_lock_serializes_critical_sections() {
        let lock = Arc::new(ReentrantLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = lock.lock();
                        let _nested = lock.lock();
                        assert_eq!(inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst), 0);
                        inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
