//! Platform abstraction for the locks and the wake primitive.
//!
//! With the `std` feature enabled, locks and the wake primitive are backed by
//! `parking_lot`. Without it, `spin` provides the locks and a blocked active
//! object busy-waits on an atomic flag.
//!
//! None of these are used for the core data structures themselves: pools,
//! queues, the registry, the subscriber table and the timer lists live behind
//! the global critical section (`critical-section` crate).

pub use std::sync::Arc;

#[cfg(not(feature = "std"))]
use core::sync::atomic::AtomicBool;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "std")]
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;
#[cfg(not(feature = "std"))]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

#[cfg(feature = "std")]
type WriteGuard<'a> = parking_lot::RwLockWriteGuard<'a, ()>;
#[cfg(not(feature = "std"))]
type WriteGuard<'a> = spin::RwLockWriteGuard<'a, ()>;

#[cfg(feature = "std")]
pub type DispatchGuard<'a> = parking_lot::RwLockReadGuard<'a, ()>;
#[cfg(not(feature = "std"))]
pub type DispatchGuard<'a> = spin::RwLockReadGuard<'a, ()>;

/// Platform-agnostic mutex wrapper.
///
/// Only guards state owned by a single execution context (an active object's
/// behavior) or by the host port, so contention is rare.
pub struct Mutex<T> {
    #[cfg(feature = "std")]
    inner: parking_lot::Mutex<T>,
    #[cfg(not(feature = "std"))]
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex protecting the given value.
    pub fn new(value: T) -> Self {
        Self {
            #[cfg(feature = "std")]
            inner: parking_lot::Mutex::new(value),
            #[cfg(not(feature = "std"))]
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquires the mutex, blocking until it becomes available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Binary wait/notify primitive an active object blocks on while its queue
/// is empty.
///
/// `signal` latches a single pending wake-up; any number of signals before
/// the next `wait` collapse into one.
pub struct Wakeup {
    #[cfg(feature = "std")]
    pending: parking_lot::Mutex<bool>,
    #[cfg(feature = "std")]
    cond: parking_lot::Condvar,
    #[cfg(not(feature = "std"))]
    pending: AtomicBool,
}

impl Wakeup {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "std")]
            pending: parking_lot::Mutex::new(false),
            #[cfg(feature = "std")]
            cond: parking_lot::Condvar::new(),
            #[cfg(not(feature = "std"))]
            pending: AtomicBool::new(false),
        }
    }

    /// Latches a wake-up and releases the waiter, if any.
    pub fn signal(&self) {
        #[cfg(feature = "std")]
        {
            let mut pending = self.pending.lock();
            *pending = true;
            self.cond.notify_one();
        }
        #[cfg(not(feature = "std"))]
        {
            self.pending.store(true, Ordering::Release);
        }
    }

    /// Blocks until a wake-up is pending, then consumes it.
    pub fn wait(&self) {
        #[cfg(feature = "std")]
        {
            let mut pending = self.pending.lock();
            while !*pending {
                self.cond.wait(&mut pending);
            }
            *pending = false;
        }
        #[cfg(not(feature = "std"))]
        {
            while !self.pending.swap(false, Ordering::Acquire) {
                core::hint::spin_loop();
            }
        }
    }

    /// Returns `true` when a wake-up is latched but not yet consumed.
    pub fn is_pending(&self) -> bool {
        #[cfg(feature = "std")]
        {
            *self.pending.lock()
        }
        #[cfg(not(feature = "std"))]
        {
            self.pending.load(Ordering::Acquire)
        }
    }
}

impl Default for Wakeup {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler lock held while a task-context publish or tick fans an event
/// out, so no recipient dequeues before every recipient has it.
///
/// Dispatch loops take the shared side only around the dequeue itself. The
/// exclusive side nests: a context that already holds it may lock again,
/// and may publish, tick or dispatch while holding it. Guards must be
/// dropped in reverse order of acquisition.
pub struct SchedulerLock {
    #[cfg(feature = "std")]
    inner: parking_lot::RwLock<()>,
    #[cfg(not(feature = "std"))]
    inner: spin::RwLock<()>,
    #[cfg(feature = "std")]
    owner: parking_lot::Mutex<Option<std::thread::ThreadId>>,
    depth: AtomicUsize,
}

impl SchedulerLock {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "std")]
            inner: parking_lot::RwLock::new(()),
            #[cfg(not(feature = "std"))]
            inner: spin::RwLock::new(()),
            #[cfg(feature = "std")]
            owner: parking_lot::Mutex::new(None),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> SchedulerGuard<'_> {
        if self.held_by_caller() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return SchedulerGuard {
                lock: self,
                write: None,
            };
        }
        let write = self.inner.write();
        #[cfg(feature = "std")]
        {
            *self.owner.lock() = Some(std::thread::current().id());
        }
        self.depth.store(1, Ordering::Relaxed);
        SchedulerGuard {
            lock: self,
            write: Some(write),
        }
    }

    /// Shared side for one dequeue. `None` when the caller already holds the
    /// exclusive side.
    pub fn dispatch_gate(&self) -> Option<DispatchGuard<'_>> {
        if self.held_by_caller() {
            None
        } else {
            Some(self.inner.read())
        }
    }

    /// Nesting depth of the exclusive side, 0 while unlocked.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[cfg(feature = "std")]
    fn held_by_caller(&self) -> bool {
        *self.owner.lock() == Some(std::thread::current().id())
    }

    // single execution context: anyone who sees a depth is the holder
    #[cfg(not(feature = "std"))]
    fn held_by_caller(&self) -> bool {
        self.depth.load(Ordering::Relaxed) > 0
    }
}

impl Default for SchedulerLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive side of a [`SchedulerLock`]; the outermost guard releases it.
pub struct SchedulerGuard<'a> {
    lock: &'a SchedulerLock,
    write: Option<WriteGuard<'a>>,
}

impl Drop for SchedulerGuard<'_> {
    fn drop(&mut self) {
        self.lock.depth.fetch_sub(1, Ordering::Relaxed);
        if self.write.is_some() {
            #[cfg(feature = "std")]
            {
                *self.lock.owner.lock() = None;
            }
            self.write = None;
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signals_collapse_into_one_wakeup() {
        let wakeup = Wakeup::new();
        wakeup.signal();
        wakeup.signal();
        assert!(wakeup.is_pending());
        wakeup.wait();
        assert!(!wakeup.is_pending());
    }

    #[test]
    fn wait_blocks_until_signalled_from_another_thread() {
        let wakeup = Arc::new(Wakeup::new());
        let remote = Arc::clone(&wakeup);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal();
        });
        wakeup.wait();
        producer.join().unwrap();
        assert!(!wakeup.is_pending());
    }

    #[test]
    fn scheduler_lock_nests_on_the_owning_thread() {
        let lock = SchedulerLock::new();
        let outer = lock.lock();
        {
            let _inner = lock.lock();
            assert_eq!(lock.depth(), 2);
            assert!(lock.dispatch_gate().is_none());
        }
        assert_eq!(lock.depth(), 1);
        drop(outer);
        assert_eq!(lock.depth(), 0);
        assert!(lock.dispatch_gate().is_some());
    }

    #[test]
    fn scheduler_lock_holds_off_other_threads() {
        let lock = Arc::new(SchedulerLock::new());
        let guard = lock.lock();
        let (tx, rx) = std::sync::mpsc::channel();
        let remote = Arc::clone(&lock);
        let dispatcher = thread::spawn(move || {
            let _gate = remote.dispatch_gate();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        dispatcher.join().unwrap();
    }
}
