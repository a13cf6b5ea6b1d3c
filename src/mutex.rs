//! Cooperative spin-with-sleep lock built on a binary semaphore.
//!
//! Waiters poll with a non-blocking take and sleep between attempts, so a
//! contended lock costs one wakeup per poll interval per waiter. The lock is
//! not reentrant, not fair, and does not inherit priority: never hold it
//! across a blocking queue receive.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::MutexError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Binary semaphore with non-blocking take and give.
#[derive(Debug)]
pub struct BinarySemaphore {
    taken: AtomicBool,
}

impl BinarySemaphore {
    /// Create a semaphore that is available.
    pub fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
        }
    }

    /// Take without blocking; false if someone else holds it.
    pub fn try_take(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Give back; fails if the semaphore was not taken.
    pub fn give(&self) -> Result<(), MutexError> {
        self.taken
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| MutexError::NotHeld)
    }
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry policy for [`PollingMutex::lock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` retries forever. A bound is opt-in: a holder that outlives it
    /// turns a slow section into a `LockTimeout` fault.
    pub max_tries: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_tries: None,
        }
    }
}

/// Data guarded by a polling binary-semaphore lock.
pub struct PollingMutex<T> {
    sem: BinarySemaphore,
    policy: PollPolicy,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` only happens through a guard, and a guard only
// exists while the semaphore is taken, so at most one thread touches `data`
// at a time. Handing `T` between threads that way needs `T: Send` only, as
// for `std::sync::Mutex`.
unsafe impl<T: Send> Send for PollingMutex<T> {}
unsafe impl<T: Send> Sync for PollingMutex<T> {}

impl<T> PollingMutex<T> {
    pub fn new(data: T) -> Self {
        Self::with_policy(data, PollPolicy::default())
    }

    pub fn with_policy(data: T, policy: PollPolicy) -> Self {
        Self {
            sem: BinarySemaphore::new(),
            policy,
            data: UnsafeCell::new(data),
        }
    }

    /// Poll until the lock is acquired or the retry bound is exhausted.
    pub fn lock(&self) -> Result<PollingGuard<'_, T>, MutexError> {
        let mut tries = 0u32;
        while !self.sem.try_take() {
            thread::sleep(self.policy.interval);
            tries += 1;
            if let Some(max) = self.policy.max_tries {
                if tries > max {
                    return Err(MutexError::LockTimeout { tries: max });
                }
            }
        }
        Ok(PollingGuard {
            mutex: self,
            released: false,
            _data: PhantomData,
        })
    }

    /// Single non-blocking attempt.
    pub fn try_lock(&self) -> Option<PollingGuard<'_, T>> {
        self.sem.try_take().then(|| PollingGuard {
            mutex: self,
            released: false,
            _data: PhantomData,
        })
    }

    /// Release explicitly, surfacing a failed give.
    pub fn unlock(guard: PollingGuard<'_, T>) -> Result<(), MutexError> {
        let mut guard = guard;
        guard.released = true;
        guard.mutex.sem.give()
    }

    /// Run `f` with the lock held.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, MutexError> {
        let mut guard = self.lock()?;
        let out = f(&mut guard);
        Self::unlock(guard)?;
        Ok(out)
    }
}

/// Proof of holding a [`PollingMutex`]; releases on drop.
///
/// The guard hands out `&T` and `&mut T`, so it is `Sync` only when `T` is.
pub struct PollingGuard<'a, T> {
    mutex: &'a PollingMutex<T>,
    released: bool,
    _data: PhantomData<&'a mut T>,
}

impl<T> Deref for PollingGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the semaphore is held for the guard's lifetime, so no other
        // guard exists for this mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for PollingGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for `deref`, and `&mut self` rules out other borrows
        // through this guard.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for PollingGuard<'_, T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.mutex.sem.give() {
            warn!("mutex release on drop failed: {err}");
        }
    }
}
