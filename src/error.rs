//! Error kinds reported by the dispatch and supervision layer.
//!
//! Low-level calls only report; `reset::ResetController` decides which
//! reports end in a system reset.

use std::time::Duration;

use thiserror::Error;

use crate::types::{CommandState, TaskId};

/// Routing failures from the dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no registry entry for target {0}")]
    UnknownTarget(TaskId),
    #[error("target {0} is disabled")]
    TaskDisabled(TaskId),
    #[error("queue of {target} is full (capacity {capacity})")]
    QueueFull { target: TaskId, capacity: usize },
    #[error("command already dispatched: {0}")]
    AlreadyDispatched(#[from] StateError),
}

/// Failures of the synchronous call pattern.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncCallError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("notification slot already has a call in flight")]
    SlotBusy,
    #[error("no completion from {target} for operation {operation} within {waited:?}")]
    Timeout {
        target: TaskId,
        operation: i32,
        waited: Duration,
    },
    #[error("{target} failed operation {operation}")]
    Failed { target: TaskId, operation: i32 },
}

/// Failures of the polling mutex helper.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MutexError {
    #[error("failed to lock mutex after {tries} tries")]
    LockTimeout { tries: u32 },
    #[error("released a mutex that was not held")]
    NotHeld,
}

/// Illegal command lifecycle transition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation {operation}: illegal transition {from:?} -> {to:?}")]
pub struct StateError {
    pub operation: i32,
    pub from: CommandState,
    pub to: CommandState,
}

/// Misuse of the watchdog registration protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchdogError {
    #[error("{0} checked in without registering with the watchdog")]
    NotRegistered(TaskId),
    #[error("{0} registered with the watchdog twice")]
    AlreadyRegistered(TaskId),
    #[error("checkin payload names {named} but was sent by {sender:?}")]
    ForgedCheckin { named: TaskId, sender: Option<TaskId> },
    #[error("no registry entry for {0}")]
    UnknownTask(TaskId),
    #[error(transparent)]
    Lock(#[from] MutexError),
}

/// Error returned by a task's command handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command ran and failed; the sender learns about it via its ack.
    #[error("command failed: {0}")]
    Failed(String),
    /// The receiving task has no handler for the operation.
    #[error("operation {0} not supported")]
    Unsupported(i32),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
}

/// Classification used by the reset policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Routing,
    Liveness,
    SyncCall,
    Consistency,
    Lock,
}

/// Anomaly escalated out of a task.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Fault {
    #[error("{task}: {source}")]
    Routing {
        task: TaskId,
        #[source]
        source: DispatchError,
    },
    #[error("{task} missed its checkin deadline (silent for {silent:?})")]
    Liveness { task: TaskId, silent: Duration },
    #[error("{task}: {source}")]
    SyncCall {
        task: TaskId,
        #[source]
        source: SyncCallError,
    },
    #[error("{task} received a command addressed to {target} (operation {operation})")]
    Misrouted {
        task: TaskId,
        target: TaskId,
        operation: i32,
    },
    #[error("{task}: {source}")]
    IllegalState {
        task: TaskId,
        #[source]
        source: StateError,
    },
    #[error("{task}: {source}")]
    Command {
        task: TaskId,
        #[source]
        source: CommandError,
    },
    #[error("{task}: {source}")]
    Watchdog {
        task: TaskId,
        #[source]
        source: WatchdogError,
    },
    #[error("{task}: {source}")]
    Lock {
        task: TaskId,
        #[source]
        source: MutexError,
    },
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Routing { .. } => FaultKind::Routing,
            Fault::Liveness { .. } => FaultKind::Liveness,
            Fault::SyncCall { .. } => FaultKind::SyncCall,
            Fault::Misrouted { .. }
            | Fault::IllegalState { .. }
            | Fault::Command { .. }
            | Fault::Watchdog { .. } => FaultKind::Consistency,
            Fault::Lock { .. } => FaultKind::Lock,
        }
    }

    /// Task the fault was raised by (or about, for liveness faults).
    pub fn task(&self) -> TaskId {
        match self {
            Fault::Routing { task, .. }
            | Fault::Liveness { task, .. }
            | Fault::SyncCall { task, .. }
            | Fault::Misrouted { task, .. }
            | Fault::IllegalState { task, .. }
            | Fault::Command { task, .. }
            | Fault::Watchdog { task, .. }
            | Fault::Lock { task, .. } => *task,
        }
    }
}

/// Rejected registrations while the task table is being built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task table is full ({limit} entries)")]
    TableFull { limit: usize },
    #[error("task {0:?} needs a queue capacity of at least 1")]
    ZeroCapacity(String),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures while bringing a system up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no handler supplied for task {0:?}")]
    MissingHandler(String),
    #[error("handler supplied for unknown task {0:?}")]
    UnknownHandler(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("failed to spawn task thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_classify_by_kind() {
        let task = TaskId::from_index(2);
        let routing = Fault::Routing {
            task,
            source: DispatchError::UnknownTarget(TaskId::from_index(9)),
        };
        assert_eq!(routing.kind(), FaultKind::Routing);
        assert_eq!(routing.task(), task);

        let misrouted = Fault::Misrouted {
            task,
            target: TaskId::from_index(1),
            operation: 4,
        };
        assert_eq!(misrouted.kind(), FaultKind::Consistency);

        let liveness = Fault::Liveness {
            task,
            silent: Duration::from_millis(10),
        };
        assert_eq!(liveness.kind(), FaultKind::Liveness);
    }

    #[test]
    fn dispatch_errors_convert_into_sync_call_errors() {
        let err: SyncCallError = DispatchError::TaskDisabled(TaskId::from_index(1)).into();
        assert!(matches!(err, SyncCallError::Dispatch(DispatchError::TaskDisabled(_))));
        assert_eq!(err.to_string(), "target task#1 is disabled");
    }
}
