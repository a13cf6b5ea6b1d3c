//! TOML system description: supervisor timing plus one table per task.
//!
//! ```toml
//! sync_call_timeout_ms = 5000
//!
//! [supervisor]
//! poll_ms = 1000
//! grace_ms = 1000
//!
//! [[task]]
//! name = "requester"
//! deadline_ms = 10000
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mutex::PollPolicy;
use crate::registry::{LoopTiming, TaskSpec};

/// Registry name of the supervisor task; reserved.
pub const SUPERVISOR_NAME: &str = "Watchdog";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Longest wait on the supervisor queue between scans.
    pub poll_ms: u64,
    pub quantum_ms: u64,
    /// Extra silence tolerated after a task turns overdue.
    pub grace_ms: u64,
    pub queue_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_ms: 1000,
            quantum_ms: 0,
            grace_ms: 1000,
            queue_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,
    pub enabled: bool,
    pub monitored: bool,
    pub queue_capacity: usize,
    pub max_block_ms: u64,
    pub quantum_ms: u64,
    pub checkin_interval_ms: u64,
    pub deadline_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            monitored: true,
            queue_capacity: 16,
            max_block_ms: 0,
            quantum_ms: 1000,
            checkin_interval_ms: 1000,
            deadline_ms: 10_000,
        }
    }
}

impl TaskConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn timing(&self) -> LoopTiming {
        LoopTiming {
            max_block: Duration::from_millis(self.max_block_ms),
            quantum: Duration::from_millis(self.quantum_ms),
            checkin_interval: Duration::from_millis(self.checkin_interval_ms),
        }
    }

    pub fn to_spec(&self) -> TaskSpec {
        TaskSpec {
            name: self.name.clone(),
            queue_capacity: self.queue_capacity,
            enabled: self.enabled,
            monitored: self.monitored,
            timing: self.timing(),
            deadline: Duration::from_millis(self.deadline_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    pub supervisor: SupervisorConfig,
    /// Tasks in registration order.
    #[serde(rename = "task")]
    pub tasks: Vec<TaskConfig>,
    pub sync_call_timeout_ms: u64,
    pub mutex_poll_ms: u64,
    /// Zero, the default, leaves the mutex helper polling forever.
    pub mutex_max_tries: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            tasks: Vec::new(),
            sync_call_timeout_ms: 5000,
            mutex_poll_ms: 5,
            mutex_max_tries: 0,
        }
    }
}

impl SystemConfig {
    /// Read, parse, and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: SystemConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sup = &self.supervisor;
        if sup.queue_capacity == 0 {
            return Err(invalid("supervisor queue_capacity must be at least 1"));
        }
        if self.sync_call_timeout_ms == 0 {
            return Err(invalid("sync_call_timeout_ms must be positive"));
        }

        let mut names = HashSet::new();
        for task in &self.tasks {
            let name = task.name.as_str();
            if name.trim().is_empty() {
                return Err(invalid("task name must not be empty"));
            }
            if name == SUPERVISOR_NAME {
                return Err(invalid(format!("task name {name:?} is reserved")));
            }
            if !names.insert(name) {
                return Err(invalid(format!("duplicate task name {name:?}")));
            }
            if task.queue_capacity == 0 {
                return Err(invalid(format!("{name}: queue_capacity must be at least 1")));
            }
            if !task.monitored {
                continue;
            }
            // A task must be able to finish a whole iteration inside its window.
            if task.max_block_ms + task.quantum_ms >= task.deadline_ms {
                return Err(invalid(format!(
                    "{name}: max_block_ms + quantum_ms ({}) must be below deadline_ms ({})",
                    task.max_block_ms + task.quantum_ms,
                    task.deadline_ms
                )));
            }
            if task.checkin_interval_ms >= task.deadline_ms {
                return Err(invalid(format!(
                    "{name}: checkin_interval_ms ({}) must be below deadline_ms ({})",
                    task.checkin_interval_ms, task.deadline_ms
                )));
            }
            // An iteration that makes a synchronous call may block for the
            // whole call timeout before it can check in.
            let with_call = task.max_block_ms + self.sync_call_timeout_ms + task.quantum_ms;
            if with_call >= task.deadline_ms {
                return Err(invalid(format!(
                    "{name}: max_block_ms + sync_call_timeout_ms + quantum_ms ({with_call}) must be below deadline_ms ({})",
                    task.deadline_ms
                )));
            }
        }

        let shortest = self
            .tasks
            .iter()
            .filter(|task| task.enabled && task.monitored)
            .map(|task| task.deadline_ms)
            .min();
        if let Some(shortest) = shortest {
            if sup.poll_ms + sup.quantum_ms >= shortest {
                return Err(invalid(format!(
                    "supervisor poll_ms + quantum_ms ({}) must be below the shortest deadline ({shortest})",
                    sup.poll_ms + sup.quantum_ms
                )));
            }
        }
        Ok(())
    }

    /// Registry entry for the supervisor itself; it is never monitored.
    pub fn supervisor_spec(&self) -> TaskSpec {
        let sup = &self.supervisor;
        let period = Duration::from_millis(sup.poll_ms);
        TaskSpec {
            name: SUPERVISOR_NAME.to_string(),
            queue_capacity: sup.queue_capacity,
            enabled: true,
            monitored: false,
            timing: LoopTiming {
                max_block: period,
                quantum: Duration::from_millis(sup.quantum_ms),
                checkin_interval: period,
            },
            deadline: Duration::MAX,
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.supervisor.grace_ms)
    }

    pub fn sync_call_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_call_timeout_ms)
    }

    pub fn lock_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.mutex_poll_ms),
            max_tries: (self.mutex_max_tries > 0).then_some(self.mutex_max_tries),
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|task| task.name == name)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
