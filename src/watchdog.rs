//! Checkin tracking and escalation of silent tasks.
//!
//! Every monitored task sends a checkin through the dispatcher. On each wake
//! the supervisor scans the registry: silence longer than a task's deadline
//! marks it overdue, and silence past deadline plus grace on a later scan
//! marks it failed and escalates to a system reset. The supervisor never
//! waits on a task it watches; its only blocking point is its own queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{CommandError, Fault, WatchdogError};
use crate::registry::{LivenessState, TaskRegistry};
use crate::reset::ResetController;
use crate::task_loop::{CommandHandler, TaskContext};
use crate::types::{Command, Payload, TaskId, ops};

/// Device-level watchdog timer.
pub trait HardwareWatchdog: Send + Sync {
    /// Push the hardware timeout further out.
    fn pet(&self);
    /// Force an immediate device reset.
    fn kick(&self);
}

/// Hosted stand-in that counts pets and kicks.
#[derive(Debug, Default)]
pub struct SimulatedWatchdog {
    pets: AtomicU64,
    kicks: AtomicU64,
}

impl SimulatedWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pets(&self) -> u64 {
        self.pets.load(Ordering::SeqCst)
    }

    pub fn kicks(&self) -> u64 {
        self.kicks.load(Ordering::SeqCst)
    }
}

impl HardwareWatchdog for SimulatedWatchdog {
    fn pet(&self) {
        self.pets.fetch_add(1, Ordering::SeqCst);
    }

    fn kick(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }
}

/// One liveness state change observed by a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub task: TaskId,
    pub from: LivenessState,
    pub to: LivenessState,
    pub silent: Duration,
}

/// Liveness bookkeeping over the registry.
pub struct WatchdogSupervisor {
    registry: Arc<TaskRegistry>,
    grace: Duration,
}

impl WatchdogSupervisor {
    pub fn new(registry: Arc<TaskRegistry>, grace: Duration) -> Self {
        Self { registry, grace }
    }

    /// Apply a checkin command received at `now`.
    pub fn handle_checkin(&self, cmd: &Command, now: Instant) -> Result<(), WatchdogError> {
        let Payload::Checkin { task } = cmd.payload else {
            return Err(WatchdogError::ForgedCheckin {
                named: cmd.target,
                sender: cmd.source,
            });
        };
        // Tasks only check in for themselves.
        if cmd.source != Some(task) {
            return Err(WatchdogError::ForgedCheckin {
                named: task,
                sender: cmd.source,
            });
        }
        let entry = self
            .registry
            .get(task)
            .ok_or(WatchdogError::UnknownTask(task))?;
        let previous = entry.record_checkin(now)?;
        if previous != LivenessState::Healthy {
            warn!("watchdog: late checkin from {} ({previous:?} -> Healthy)", entry.name());
        } else {
            debug!("watchdog: {} checked in", entry.name());
        }
        Ok(())
    }

    /// Classify every registered task against `now`.
    pub fn scan(&self, now: Instant) -> Result<Vec<Transition>, WatchdogError> {
        let mut transitions = Vec::new();
        for entry in self.registry.entries() {
            let deadline = entry.deadline();
            let grace = self.grace;
            let change = entry.update_liveness(|record| {
                if !record.registered {
                    return None;
                }
                let silent = now.saturating_duration_since(record.last_checkin);
                let next = match record.state {
                    LivenessState::Healthy if silent > deadline => LivenessState::Overdue,
                    LivenessState::Overdue if silent > deadline.saturating_add(grace) => {
                        LivenessState::Failed
                    }
                    _ => return None,
                };
                let from = std::mem::replace(&mut record.state, next);
                Some(Transition {
                    task: entry.id(),
                    from,
                    to: next,
                    silent,
                })
            })?;
            transitions.extend(change);
        }
        Ok(transitions)
    }

    pub fn liveness_of(&self, task: TaskId) -> Result<LivenessState, WatchdogError> {
        let entry = self
            .registry
            .get(task)
            .ok_or(WatchdogError::UnknownTask(task))?;
        Ok(entry.liveness()?.state)
    }
}

/// Supervisor task: handles checkins, scans after each drain, and hands
/// failures to the reset policy.
pub struct SupervisorHandler {
    supervisor: WatchdogSupervisor,
    resets: Arc<ResetController>,
}

impl SupervisorHandler {
    pub fn new(supervisor: WatchdogSupervisor, resets: Arc<ResetController>) -> Self {
        Self { supervisor, resets }
    }

    pub fn supervisor(&self) -> &WatchdogSupervisor {
        &self.supervisor
    }
}

impl CommandHandler for SupervisorHandler {
    fn execute(&mut self, _ctx: &TaskContext, cmd: &mut Command) -> Result<(), CommandError> {
        match cmd.operation {
            ops::CHECKIN => Ok(self.supervisor.handle_checkin(cmd, Instant::now())?),
            other => Err(CommandError::Unsupported(other)),
        }
    }

    fn after_drain(&mut self, ctx: &TaskContext) -> Result<(), Fault> {
        let transitions = self
            .supervisor
            .scan(Instant::now())
            .map_err(|source| Fault::Watchdog {
                task: ctx.id(),
                source,
            })?;

        let mut failed = false;
        for t in transitions {
            let name = ctx.registry().name_of(t.task);
            match t.to {
                LivenessState::Overdue => {
                    info!("watchdog: {name} is overdue (silent for {:?})", t.silent);
                }
                LivenessState::Failed => {
                    error!("watchdog: {name} failed (silent for {:?})", t.silent);
                    failed = true;
                    self.resets.escalate(Fault::Liveness {
                        task: t.task,
                        silent: t.silent,
                    });
                }
                LivenessState::Healthy => {}
            }
        }

        if !failed {
            self.resets.pet();
        }
        Ok(())
    }
}
