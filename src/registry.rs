//! Process-wide task table: identity, queue, timing, and liveness per task.
//!
//! The table is built once by [`RegistryBuilder`] before any task loop starts
//! and is read-only afterwards except for two fields: the enable flag and the
//! liveness record, which is guarded by the polling mutex.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{MutexError, RegistryError, WatchdogError};
use crate::mutex::{PollPolicy, PollingMutex};
use crate::task_queue::TaskQueue;
use crate::types::TaskId;

/// Most tasks one registry can hold; identities are 16-bit.
pub const MAX_TASKS: usize = u16::MAX as usize + 1;

/// Checkin recency classification maintained by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessState {
    Healthy,
    Overdue,
    Failed,
}

/// Timing of one task's loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopTiming {
    /// Longest wait on the queue before running the post-drain steps.
    pub max_block: Duration,
    /// Fixed sleep at the end of each iteration.
    pub quantum: Duration,
    /// How often the task sends a checkin.
    pub checkin_interval: Duration,
}

/// Static description of a task, supplied at registration.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub name: String,
    pub queue_capacity: usize,
    pub enabled: bool,
    /// Whether the supervisor expects checkins from this task.
    pub monitored: bool,
    pub timing: LoopTiming,
    /// Silence longer than this marks the task overdue.
    pub deadline: Duration,
}

/// Liveness fields written by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessRecord {
    pub last_checkin: Instant,
    pub state: LivenessState,
    pub registered: bool,
}

pub struct TaskEntry {
    id: TaskId,
    spec: TaskSpec,
    queue: TaskQueue,
    enabled: AtomicBool,
    liveness: PollingMutex<LivenessRecord>,
}

impl TaskEntry {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn deadline(&self) -> Duration {
        self.spec.deadline
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Snapshot of the liveness record.
    pub fn liveness(&self) -> Result<LivenessRecord, MutexError> {
        self.liveness.with_lock(|record| *record)
    }

    /// Start expecting checkins; the deadline window opens at `now`.
    pub fn register_with_watchdog(&self, now: Instant) -> Result<(), WatchdogError> {
        let registered = self.liveness.with_lock(|record| {
            if record.registered {
                return false;
            }
            *record = LivenessRecord {
                last_checkin: now,
                state: LivenessState::Healthy,
                registered: true,
            };
            true
        })?;
        if !registered {
            return Err(WatchdogError::AlreadyRegistered(self.id));
        }
        debug!("{} registered with watchdog", self.name());
        Ok(())
    }

    /// Stop expecting checkins.
    pub fn unregister_from_watchdog(&self) -> Result<(), WatchdogError> {
        let was_registered = self
            .liveness
            .with_lock(|record| std::mem::replace(&mut record.registered, false))?;
        if !was_registered {
            return Err(WatchdogError::NotRegistered(self.id));
        }
        debug!("{} unregistered from watchdog", self.name());
        Ok(())
    }

    /// Record a checkin; returns the state it replaced.
    pub fn record_checkin(&self, now: Instant) -> Result<LivenessState, WatchdogError> {
        let previous = self.liveness.with_lock(|record| {
            if !record.registered {
                return None;
            }
            record.last_checkin = now;
            Some(std::mem::replace(&mut record.state, LivenessState::Healthy))
        })?;
        previous.ok_or(WatchdogError::NotRegistered(self.id))
    }

    pub(crate) fn update_liveness<R>(
        &self,
        f: impl FnOnce(&mut LivenessRecord) -> R,
    ) -> Result<R, MutexError> {
        self.liveness.with_lock(f)
    }
}

/// Read-mostly table shared by the dispatcher, the task loops, and the
/// supervisor.
pub struct TaskRegistry {
    entries: Vec<TaskEntry>,
}

impl TaskRegistry {
    pub fn get(&self, id: TaskId) -> Option<&TaskEntry> {
        self.entries.get(id.index())
    }

    /// Resolve a task by name.
    pub fn lookup(&self, name: &str) -> Option<TaskId> {
        self.entries
            .iter()
            .find(|entry| entry.name() == name)
            .map(TaskEntry::id)
    }

    pub fn name_of(&self, id: TaskId) -> &str {
        self.get(id).map(TaskEntry::name).unwrap_or("<unknown>")
    }

    pub fn entries(&self) -> impl Iterator<Item = &TaskEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enable or disable dispatch to a task; returns the previous flag.
    pub fn set_enabled(&self, id: TaskId, enabled: bool) -> Option<bool> {
        let entry = self.get(id)?;
        let previous = entry.enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(
                "{} {}",
                entry.name(),
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Some(previous)
    }
}

/// Collects task registrations in a fixed order during initialization.
pub struct RegistryBuilder {
    entries: Vec<TaskEntry>,
    lock_policy: PollPolicy,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::with_lock_policy(PollPolicy::default())
    }

    /// Use `policy` for every entry's liveness lock.
    pub fn with_lock_policy(lock_policy: PollPolicy) -> Self {
        Self {
            entries: Vec::new(),
            lock_policy,
        }
    }

    /// Register a task; identities follow registration order.
    pub fn register(&mut self, spec: TaskSpec) -> Result<TaskId, RegistryError> {
        let index = u16::try_from(self.entries.len())
            .map_err(|_| RegistryError::TableFull { limit: MAX_TASKS })?;
        if spec.queue_capacity == 0 {
            return Err(RegistryError::ZeroCapacity(spec.name));
        }
        let id = TaskId::from_index(index);
        let record = LivenessRecord {
            last_checkin: Instant::now(),
            state: LivenessState::Healthy,
            registered: false,
        };
        self.entries.push(TaskEntry {
            id,
            queue: TaskQueue::with_capacity(spec.queue_capacity),
            enabled: AtomicBool::new(spec.enabled),
            liveness: PollingMutex::with_policy(record, self.lock_policy),
            spec,
        });
        Ok(id)
    }

    pub fn build(self) -> Arc<TaskRegistry> {
        Arc::new(TaskRegistry {
            entries: self.entries,
        })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
