//! Shared identifiers and the command model exchanged between tasks.

use std::fmt;
use std::sync::Arc;

use crate::error::StateError;
use crate::notify::Continuation;

/// Stable handle naming one registered task.
///
/// Identities are handed out by the registry in registration order and are
/// never reused while the system runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u16);

impl TaskId {
    pub(crate) fn from_index(index: u16) -> Self {
        Self(index)
    }

    /// Position of the task in the registry table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Operation codes. Negative values are reserved for the framework;
/// non-negative codes are interpreted by the receiving task.
pub mod ops {
    /// Hand a unit of processing to another task (synchronous-call demo).
    pub const PROCESSING_HANDOFF: i32 = -1;
    /// Liveness checkin addressed to the supervisor.
    pub const CHECKIN: i32 = -2;
    /// Acknowledgement of a completed command, sent back to its source.
    pub const ACK: i32 = -3;

    pub fn is_reserved(operation: i32) -> bool {
        operation < 0
    }
}

/// Lifecycle of a command from construction to a terminal outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandState {
    Created,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Completed | CommandState::Failed)
    }
}

/// Terminal outcome reported to whoever waits on a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Failed,
}

/// Typed payload carried by a command.
///
/// Shared data travels as `Arc<[u8]>` so the receiver only ever gets a
/// read-only view; handing off mutable state means moving it in.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Payload {
    #[default]
    Empty,
    /// Names the task that is checking in.
    Checkin { task: TaskId },
    /// Outcome of an earlier command, delivered to its source.
    Ack { operation: i32, outcome: Completion },
    Value(i64),
    Bytes(Arc<[u8]>),
}

impl Payload {
    /// Length in bytes of the data this payload stands for.
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Checkin { .. } => std::mem::size_of::<TaskId>(),
            Payload::Ack { .. } => std::mem::size_of::<i32>() + 1,
            Payload::Value(_) => std::mem::size_of::<i64>(),
            Payload::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One unit of inter-task work.
///
/// A command is moved into the target's queue by the dispatcher and moved out
/// again by the target's loop, so only the current holder can touch it.
#[derive(Debug)]
pub struct Command {
    pub target: TaskId,
    pub source: Option<TaskId>,
    pub operation: i32,
    pub payload: Payload,
    pub requires_ack: bool,
    state: CommandState,
    continuation: Option<Continuation>,
}

impl Command {
    /// Create a command with no source, payload, or acknowledgement.
    pub fn new(target: TaskId, operation: i32) -> Self {
        Self {
            target,
            source: None,
            operation,
            payload: Payload::Empty,
            requires_ack: false,
            state: CommandState::Created,
            continuation: None,
        }
    }

    pub fn from_source(mut self, source: TaskId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    /// Checkin command a task sends to the supervisor.
    pub fn checkin(task: TaskId, supervisor: TaskId) -> Self {
        Command::new(supervisor, ops::CHECKIN)
            .from_source(task)
            .with_payload(Payload::Checkin { task })
    }

    /// Acknowledgement sent back to the source of `original`.
    pub fn ack_for(original: &Command, source: TaskId, outcome: Completion) -> Self {
        Command::new(source, ops::ACK)
            .from_source(original.target)
            .with_payload(Payload::Ack {
                operation: original.operation,
                outcome,
            })
    }

    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Attach the slot to signal once this command reaches a terminal state.
    pub(crate) fn set_continuation(&mut self, continuation: Continuation) {
        self.continuation = Some(continuation);
    }

    pub(crate) fn take_continuation(&mut self) -> Option<Continuation> {
        self.continuation.take()
    }

    pub(crate) fn mark_queued(&mut self) -> Result<(), StateError> {
        self.transition(CommandState::Created, CommandState::Queued)
    }

    pub(crate) fn begin_processing(&mut self) -> Result<(), StateError> {
        self.transition(CommandState::Queued, CommandState::Processing)
    }

    pub(crate) fn finish(&mut self, outcome: Completion) -> Result<(), StateError> {
        let next = match outcome {
            Completion::Completed => CommandState::Completed,
            Completion::Failed => CommandState::Failed,
        };
        self.transition(CommandState::Processing, next)
    }

    fn transition(&mut self, expected: CommandState, next: CommandState) -> Result<(), StateError> {
        if self.state != expected {
            return Err(StateError {
                operation: self.operation,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}
