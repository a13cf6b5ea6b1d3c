//! Single entry point that routes a command onto its target's queue.

use std::sync::Arc;

use log::debug;

use crate::error::DispatchError;
use crate::registry::{TaskEntry, TaskRegistry};
use crate::types::Command;

/// Routes commands by resolving `target` in the registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Append `cmd` to its target's queue without blocking.
    ///
    /// Fails if the target is unknown, disabled, or its queue is at capacity,
    /// or if the command left the `Created` state already. The command is
    /// dropped in every failure case.
    pub fn enqueue(&self, mut cmd: Command) -> Result<(), DispatchError> {
        let entry = self.resolve(&cmd)?;
        cmd.mark_queued()?;
        let target = cmd.target;
        let operation = cmd.operation;
        entry.queue().push(cmd).map_err(|_| DispatchError::QueueFull {
            target,
            capacity: entry.queue().capacity(),
        })?;
        debug!(
            "dispatch: operation {operation} -> {} (depth {})",
            entry.name(),
            entry.queue().len()
        );
        Ok(())
    }

    fn resolve(&self, cmd: &Command) -> Result<&TaskEntry, DispatchError> {
        let entry = self
            .registry
            .get(cmd.target)
            .ok_or(DispatchError::UnknownTarget(cmd.target))?;
        if !entry.is_enabled() {
            return Err(DispatchError::TaskDisabled(cmd.target));
        }
        Ok(entry)
    }
}
