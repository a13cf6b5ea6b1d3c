//! Inter-task command dispatch and liveness supervision for a fixed set of
//! cooperating tasks.
//!
//! Tasks are registered once at startup ([`system::SystemBuilder`]), each runs
//! the same [`task_loop::TaskLoop`], and every exchange between them is a
//! [`types::Command`] moved through the [`dispatcher::Dispatcher`] into the
//! target's bounded queue. The watchdog task tracks checkins and escalates
//! silent tasks to a single system reset.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod mutex;
pub mod notify;
pub mod registry;
pub mod reset;
pub mod sim;
pub mod system;
pub mod task_loop;
pub mod task_queue;
pub mod types;
pub mod watchdog;

pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Fault, FaultKind, SyncCallError};
pub use system::{RunningSystem, SystemBuilder, SystemReport};
pub use task_loop::{CommandHandler, TaskContext};
pub use types::{Command, CommandState, Completion, Payload, TaskId};
