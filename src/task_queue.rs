//! Bounded FIFO command queue with timed and non-blocking consumers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::types::Command;

/// Fixed-capacity FIFO owned by one registry entry.
pub struct TaskQueue {
    inner: Mutex<VecDeque<Command>>,
    available: Condvar,
    capacity: usize,
}

impl TaskQueue {
    /// Create an empty queue holding at most `capacity` commands.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    // Holders never panic while the lock is held, so a poisoned queue still
    // has a consistent deque.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append without blocking; hands the command back if the queue is full.
    pub fn push(&self, cmd: Command) -> Result<(), Command> {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            return Err(cmd);
        }
        guard.push_back(cmd);
        self.available.notify_one();
        Ok(())
    }

    /// Pop the oldest command immediately, if any.
    pub fn try_receive(&self) -> Option<Command> {
        self.lock().pop_front()
    }

    /// Block until a command arrives or `timeout` elapses.
    pub fn receive(&self, timeout: Duration) -> Option<Command> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(cmd) = guard.pop_front() {
                return Some(cmd);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            // Spurious wakeups fall through to the deadline check above.
            let (next, _) = self
                .available
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard = next;
        }
    }

    /// Empty the queue in one pass, oldest first.
    pub fn drain_nonblocking(&self) -> Vec<Command> {
        let mut drained = Vec::new();
        while let Some(cmd) = self.try_receive() {
            drained.push(cmd);
        }
        drained
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of queued commands.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
