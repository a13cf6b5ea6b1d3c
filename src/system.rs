//! Bring-up and teardown of a whole system: registry, supervisor, and one
//! named thread per enabled task.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::SystemConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Fault, StartError};
use crate::registry::{LivenessState, RegistryBuilder, TaskRegistry};
use crate::reset::ResetController;
use crate::task_loop::{CommandHandler, Shutdown, TaskContext, TaskLoop};
use crate::types::TaskId;
use crate::watchdog::{HardwareWatchdog, SimulatedWatchdog, SupervisorHandler, WatchdogSupervisor};

type LoopHandle = thread::JoinHandle<Option<Fault>>;

/// Collects configuration and per-task handlers before starting threads.
pub struct SystemBuilder {
    config: SystemConfig,
    hw: Arc<dyn HardwareWatchdog>,
    handlers: HashMap<String, Box<dyn CommandHandler>>,
}

impl SystemBuilder {
    pub fn new(config: SystemConfig) -> Self {
        Self {
            config,
            hw: Arc::new(SimulatedWatchdog::new()),
            handlers: HashMap::new(),
        }
    }

    pub fn hardware_watchdog(mut self, hw: Arc<dyn HardwareWatchdog>) -> Self {
        self.hw = hw;
        self
    }

    /// Behaviour of the task configured as `name`.
    pub fn handler(mut self, name: &str, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.insert(name.to_string(), Box::new(handler));
        self
    }

    /// Validate, register every task in config order with the supervisor
    /// first, then spawn the loops.
    pub fn start(mut self) -> Result<RunningSystem, StartError> {
        self.config.validate()?;

        if let Some(name) = self
            .handlers
            .keys()
            .find(|name| self.config.task(name).is_none())
        {
            return Err(StartError::UnknownHandler(name.clone()));
        }

        let mut builder = RegistryBuilder::with_lock_policy(self.config.lock_policy());
        let supervisor = builder.register(self.config.supervisor_spec())?;
        let mut tasks = Vec::new();
        for task in &self.config.tasks {
            let id = builder.register(task.to_spec())?;
            if !task.enabled {
                info!("{}: disabled, not started", task.name);
                continue;
            }
            let handler = self
                .handlers
                .remove(&task.name)
                .ok_or_else(|| StartError::MissingHandler(task.name.clone()))?;
            tasks.push((id, handler));
        }
        let registry = builder.build();

        let now = Instant::now();
        for (id, _) in &tasks {
            if let Some(entry) = registry.get(*id) {
                if entry.spec().monitored {
                    entry.register_with_watchdog(now)?;
                }
            }
        }

        let shutdown = Shutdown::new();
        let resets = Arc::new(ResetController::new(Arc::clone(&self.hw), shutdown.clone()));
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let mut system = RunningSystem {
            registry: Arc::clone(&registry),
            dispatcher: dispatcher.clone(),
            supervisor,
            resets: Arc::clone(&resets),
            shutdown: shutdown.clone(),
            threads: Vec::new(),
        };

        let watchdog = SupervisorHandler::new(
            WatchdogSupervisor::new(Arc::clone(&registry), self.config.grace()),
            Arc::clone(&resets),
        );
        let ctx = TaskContext::new(dispatcher.clone(), supervisor, None, shutdown.clone())?;
        system.spawn(ctx, watchdog)?;

        for (id, handler) in tasks {
            let ctx = TaskContext::new(dispatcher.clone(), id, Some(supervisor), shutdown.clone())?;
            system.spawn(ctx, handler)?;
        }
        info!("system started with {} tasks", system.threads.len());
        Ok(system)
    }
}

/// Handle to a started system.
pub struct RunningSystem {
    registry: Arc<TaskRegistry>,
    dispatcher: Dispatcher,
    supervisor: TaskId,
    resets: Arc<ResetController>,
    shutdown: Shutdown,
    threads: Vec<(TaskId, LoopHandle)>,
}

impl RunningSystem {
    fn spawn<H: CommandHandler + 'static>(
        &mut self,
        ctx: TaskContext,
        handler: H,
    ) -> Result<(), StartError> {
        let id = ctx.id();
        let resets = Arc::clone(&self.resets);
        let spawned = thread::Builder::new()
            .name(ctx.name().to_string())
            .spawn(move || match TaskLoop::new(ctx, handler).run() {
                Ok(()) => None,
                Err(fault) => {
                    resets.escalate(fault.clone());
                    Some(fault)
                }
            });
        match spawned {
            Ok(handle) => {
                self.threads.push((id, handle));
                Ok(())
            }
            Err(err) => {
                self.shutdown.trigger();
                for (_, handle) in self.threads.drain(..) {
                    let _ = handle.join();
                }
                Err(err.into())
            }
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> TaskId {
        self.supervisor
    }

    pub fn resets(&self) -> &Arc<ResetController> {
        &self.resets
    }

    /// Poll until a reset is requested or `timeout` passes.
    pub fn wait_for_reset(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.resets.reset_requested() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Ask every loop to stop, then collect the results.
    pub fn stop(self) -> SystemReport {
        self.shutdown.trigger();
        self.join()
    }

    /// Wait for every loop to exit on its own (after a reset or `stop`).
    pub fn join(self) -> SystemReport {
        let mut faults = Vec::new();
        for (id, handle) in self.threads {
            match handle.join() {
                Ok(Some(fault)) => faults.push(fault),
                Ok(None) => {}
                Err(_) => error!("{} panicked", self.registry.name_of(id)),
            }
        }

        let mut undelivered = 0;
        let mut liveness = Vec::new();
        for entry in self.registry.entries() {
            let dropped = entry.queue().drain_nonblocking().len();
            if dropped > 0 {
                warn!("{}: dropped {dropped} undelivered commands", entry.name());
                undelivered += dropped;
            }
            match entry.liveness() {
                Ok(record) if record.registered => {
                    liveness.push((entry.name().to_string(), record.state));
                }
                Ok(_) => {}
                Err(err) => warn!("{}: liveness unavailable: {err}", entry.name()),
            }
        }
        debug!("system stopped");

        SystemReport {
            faults,
            reset: self.resets.reason(),
            fault_reports: self.resets.fault_count(),
            liveness,
            undelivered,
        }
    }
}

/// Outcome of a system run.
#[derive(Debug)]
pub struct SystemReport {
    /// Faults that ended a task loop.
    pub faults: Vec<Fault>,
    /// Fault that triggered the reset, if any.
    pub reset: Option<Fault>,
    /// Every fault report, including ones after the reset.
    pub fault_reports: usize,
    /// Final liveness per monitored task, in registration order.
    pub liveness: Vec<(String, LivenessState)>,
    pub undelivered: usize,
}

impl SystemReport {
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.liveness
            .iter()
            .filter(|(_, state)| *state == LivenessState::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
