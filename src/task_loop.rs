//! The loop every task runs: block on its queue, drain it, check in, sleep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{CommandError, DispatchError, Fault};
use crate::notify::{self, Notification};
use crate::registry::{LoopTiming, TaskRegistry};
use crate::types::{Command, Completion, Payload, TaskId, ops};

/// Shared stop flag for every loop in a running system.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a task's loop knows about itself and its environment.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    dispatcher: Dispatcher,
    supervisor: Option<TaskId>,
    timing: LoopTiming,
    monitored: bool,
    shutdown: Shutdown,
}

impl TaskContext {
    /// Build the context for registered task `id`.
    pub fn new(
        dispatcher: Dispatcher,
        id: TaskId,
        supervisor: Option<TaskId>,
        shutdown: Shutdown,
    ) -> Result<Self, DispatchError> {
        let entry = dispatcher
            .registry()
            .get(id)
            .ok_or(DispatchError::UnknownTarget(id))?;
        let timing = entry.spec().timing;
        let monitored = entry.spec().monitored;
        Ok(Self {
            id,
            dispatcher,
            supervisor,
            timing,
            monitored,
            shutdown,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.registry().name_of(self.id)
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        self.dispatcher.registry()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn timing(&self) -> LoopTiming {
        self.timing
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Dispatch a command from this task.
    pub fn enqueue(&self, cmd: Command) -> Result<(), Fault> {
        self.dispatcher.enqueue(cmd).map_err(|source| Fault::Routing {
            task: self.id,
            source,
        })
    }

    /// Synchronous call from this task; a timeout is a fault.
    pub fn call(
        &self,
        cmd: Command,
        slot: &Arc<Notification>,
        timeout: Duration,
    ) -> Result<(), Fault> {
        let cmd = cmd.from_source(self.id);
        notify::call(&self.dispatcher, cmd, slot, timeout).map_err(|source| Fault::SyncCall {
            task: self.id,
            source,
        })
    }
}

/// Task-specific behaviour plugged into [`TaskLoop`].
pub trait CommandHandler: Send {
    /// Execute one command addressed to this task.
    fn execute(&mut self, ctx: &TaskContext, cmd: &mut Command) -> Result<(), CommandError>;

    /// Acknowledgement of a command this task sent earlier.
    fn on_ack(&mut self, ctx: &TaskContext, operation: i32, outcome: Completion) {
        debug!("{}: ack for operation {operation}: {outcome:?}", ctx.name());
    }

    /// Runs once per iteration after the queue is empty.
    fn after_drain(&mut self, _ctx: &TaskContext) -> Result<(), Fault> {
        Ok(())
    }
}

impl<H: CommandHandler + ?Sized> CommandHandler for Box<H> {
    fn execute(&mut self, ctx: &TaskContext, cmd: &mut Command) -> Result<(), CommandError> {
        (**self).execute(ctx, cmd)
    }

    fn on_ack(&mut self, ctx: &TaskContext, operation: i32, outcome: Completion) {
        (**self).on_ack(ctx, operation, outcome)
    }

    fn after_drain(&mut self, ctx: &TaskContext) -> Result<(), Fault> {
        (**self).after_drain(ctx)
    }
}

pub struct TaskLoop<H> {
    ctx: TaskContext,
    handler: H,
    last_checkin: Option<Instant>,
}

impl<H: CommandHandler> TaskLoop<H> {
    pub fn new(ctx: TaskContext, handler: H) -> Self {
        Self {
            ctx,
            handler,
            last_checkin: None,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Loop until shutdown or the first fault.
    pub fn run(mut self) -> Result<(), Fault> {
        info!("{}: task started", self.ctx.name());
        while !self.ctx.shutdown.is_triggered() {
            self.run_once()?;
            thread::sleep(self.ctx.timing.quantum);
        }
        info!("{}: task stopped", self.ctx.name());
        Ok(())
    }

    /// One iteration without the trailing sleep; returns how many commands
    /// were executed.
    pub fn run_once(&mut self) -> Result<usize, Fault> {
        let registry = Arc::clone(self.ctx.registry());
        let queue = registry
            .get(self.ctx.id)
            .ok_or(Fault::Routing {
                task: self.ctx.id,
                source: DispatchError::UnknownTarget(self.ctx.id),
            })?
            .queue();

        let mut executed = 0;
        if let Some(first) = queue.receive(self.ctx.timing.max_block) {
            self.process(first)?;
            executed += 1;
            // Commands enqueued while draining are picked up in this pass.
            while let Some(cmd) = queue.try_receive() {
                self.process(cmd)?;
                executed += 1;
            }
        }

        self.handler.after_drain(&self.ctx)?;
        self.checkin_if_due(Instant::now())?;
        Ok(executed)
    }

    fn checkin_if_due(&mut self, now: Instant) -> Result<(), Fault> {
        let Some(supervisor) = self.ctx.supervisor else {
            return Ok(());
        };
        if !self.ctx.monitored {
            return Ok(());
        }
        let due = self
            .last_checkin
            .is_none_or(|last| now.duration_since(last) >= self.ctx.timing.checkin_interval);
        if due {
            self.ctx.enqueue(Command::checkin(self.ctx.id, supervisor))?;
            self.last_checkin = Some(now);
            debug!("{}: checkin sent", self.ctx.name());
        }
        Ok(())
    }

    fn process(&mut self, mut cmd: Command) -> Result<(), Fault> {
        let task = self.ctx.id;
        if cmd.target != task {
            return Err(Fault::Misrouted {
                task,
                target: cmd.target,
                operation: cmd.operation,
            });
        }
        cmd.begin_processing()
            .map_err(|source| Fault::IllegalState { task, source })?;
        debug!(
            "{}: executing operation {} from {:?}",
            self.ctx.name(),
            cmd.operation,
            cmd.source
        );

        if cmd.operation == ops::ACK {
            if let Payload::Ack { operation, outcome } = cmd.payload {
                self.handler.on_ack(&self.ctx, operation, outcome);
                return self.settle(cmd, Completion::Completed);
            }
        }

        match self.handler.execute(&self.ctx, &mut cmd) {
            Ok(()) => self.settle(cmd, Completion::Completed),
            Err(CommandError::Failed(reason)) => {
                warn!(
                    "{}: operation {} failed: {reason}",
                    self.ctx.name(),
                    cmd.operation
                );
                self.settle(cmd, Completion::Failed)
            }
            Err(err) => {
                self.settle(cmd, Completion::Failed)?;
                Err(Fault::Command { task, source: err })
            }
        }
    }

    /// Move the command to its terminal state and tell whoever asked.
    fn settle(&self, mut cmd: Command, outcome: Completion) -> Result<(), Fault> {
        let task = self.ctx.id;
        cmd.finish(outcome)
            .map_err(|source| Fault::IllegalState { task, source })?;
        if !cmd.requires_ack {
            return Ok(());
        }
        if let Some(continuation) = cmd.take_continuation() {
            if !continuation.signal(outcome) {
                warn!(
                    "{}: completion of operation {} arrived after its caller gave up",
                    self.ctx.name(),
                    cmd.operation
                );
            }
            return Ok(());
        }
        match cmd.source {
            Some(source) => self.ctx.enqueue(Command::ack_for(&cmd, source, outcome)),
            None => {
                warn!(
                    "{}: operation {} wants an ack but has no source",
                    self.ctx.name(),
                    cmd.operation
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use crate::registry::tests::spec;
    use crate::types::CommandState;
    use std::sync::Mutex;

    /// Records what it executes; operation 13 fails, 99 is unsupported.
    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(i32, CommandState)>>>,
        acks: Arc<Mutex<Vec<(i32, Completion)>>>,
    }

    impl CommandHandler for Recorder {
        fn execute(&mut self, _ctx: &TaskContext, cmd: &mut Command) -> Result<(), CommandError> {
            self.seen
                .lock()
                .expect("seen mutex poisoned")
                .push((cmd.operation, cmd.state()));
            match cmd.operation {
                13 => Err(CommandError::Failed("unlucky".into())),
                99 => Err(CommandError::Unsupported(99)),
                _ => Ok(()),
            }
        }

        fn on_ack(&mut self, _ctx: &TaskContext, operation: i32, outcome: Completion) {
            self.acks
                .lock()
                .expect("ack mutex poisoned")
                .push((operation, outcome));
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        supervisor: TaskId,
        a: TaskId,
        b: TaskId,
    }

    fn fixture() -> Fixture {
        let mut builder = RegistryBuilder::new();
        let mut watchdog = spec("Watchdog");
        watchdog.monitored = false;
        let supervisor = builder.register(watchdog).expect("register");
        let a = builder.register(spec("A")).expect("register");
        let b = builder.register(spec("B")).expect("register");
        Fixture {
            dispatcher: Dispatcher::new(builder.build()),
            supervisor,
            a,
            b,
        }
    }

    fn task_loop(fx: &Fixture, id: TaskId) -> TaskLoop<Recorder> {
        let ctx = TaskContext::new(fx.dispatcher.clone(), id, Some(fx.supervisor), Shutdown::new())
            .expect("context");
        TaskLoop::new(ctx, Recorder::default())
    }

    fn supervisor_queue(fx: &Fixture) -> &crate::task_queue::TaskQueue {
        fx.dispatcher.registry().get(fx.supervisor).expect("entry").queue()
    }

    #[test]
    fn burst_is_drained_in_one_iteration_in_order() {
        let fx = fixture();
        let mut b = task_loop(&fx, fx.b);
        for op in 0..4 {
            fx.dispatcher.enqueue(Command::new(fx.b, op)).expect("enqueue");
        }
        assert_eq!(b.run_once().expect("iteration"), 4);
        let seen = b.handler().seen.lock().expect("seen mutex poisoned").clone();
        assert_eq!(
            seen,
            (0..4).map(|op| (op, CommandState::Processing)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn checkin_is_sent_when_due() {
        let fx = fixture();
        let mut a = task_loop(&fx, fx.a);
        a.run_once().expect("first iteration");
        let checkin = supervisor_queue(&fx).try_receive().expect("checkin");
        assert_eq!(checkin.operation, ops::CHECKIN);
        assert_eq!(checkin.source, Some(fx.a));

        // Interval (50ms) has not elapsed yet.
        a.run_once().expect("second iteration");
        assert!(supervisor_queue(&fx).is_empty());

        thread::sleep(Duration::from_millis(60));
        a.run_once().expect("third iteration");
        assert!(supervisor_queue(&fx).try_receive().is_some());
    }

    #[test]
    fn misrouted_command_is_a_fault() {
        let fx = fixture();
        let mut a = task_loop(&fx, fx.a);
        // Push straight onto A's queue, bypassing the dispatcher's routing.
        let mut stray = Command::new(fx.b, 7);
        stray.mark_queued().expect("queue");
        let queue = fx.dispatcher.registry().get(fx.a).expect("entry").queue();
        queue.push(stray).expect("queue full");

        let fault = a.run_once().expect_err("misrouted command executed");
        assert_eq!(
            fault,
            Fault::Misrouted {
                task: fx.a,
                target: fx.b,
                operation: 7
            }
        );
        assert!(a.handler().seen.lock().expect("seen mutex poisoned").is_empty());
    }

    #[test]
    fn ack_is_returned_to_source() {
        let fx = fixture();
        let mut a = task_loop(&fx, fx.a);
        let mut b = task_loop(&fx, fx.b);

        fx.dispatcher
            .enqueue(Command::new(fx.b, 5).from_source(fx.a).with_ack())
            .expect("enqueue");
        fx.dispatcher
            .enqueue(Command::new(fx.b, 13).from_source(fx.a).with_ack())
            .expect("enqueue");
        b.run_once().expect("b iteration");
        a.run_once().expect("a iteration");

        let acks = a.handler().acks.lock().expect("ack mutex poisoned").clone();
        assert_eq!(
            acks,
            vec![(5, Completion::Completed), (13, Completion::Failed)]
        );
    }

    #[test]
    fn continuation_is_signalled_on_completion() {
        let fx = fixture();
        let mut b = task_loop(&fx, fx.b);
        let slot = Notification::new();
        let mut cmd = Command::new(fx.b, 5).from_source(fx.a).with_ack();
        cmd.set_continuation(slot.arm().expect("arm"));
        fx.dispatcher.enqueue(cmd).expect("enqueue");

        b.run_once().expect("b iteration");
        assert_eq!(slot.take(Duration::ZERO), Some(Completion::Completed));
        // Continuations replace the ack command.
        let a_queue = fx.dispatcher.registry().get(fx.a).expect("entry").queue();
        assert!(a_queue.is_empty());
    }

    #[test]
    fn unsupported_operation_is_fatal_after_settling() {
        let fx = fixture();
        let mut b = task_loop(&fx, fx.b);
        let mut a = task_loop(&fx, fx.a);
        fx.dispatcher
            .enqueue(Command::new(fx.b, 99).from_source(fx.a).with_ack())
            .expect("enqueue");
        let fault = b.run_once().expect_err("unsupported operation accepted");
        assert_eq!(fault.kind(), crate::error::FaultKind::Consistency);
        a.run_once().expect("a iteration");
        let acks = a.handler().acks.lock().expect("ack mutex poisoned").clone();
        assert_eq!(acks, vec![(99, Completion::Failed)]);
    }

    #[test]
    fn run_returns_after_shutdown() {
        let fx = fixture();
        let shutdown = Shutdown::new();
        let ctx = TaskContext::new(fx.dispatcher.clone(), fx.a, Some(fx.supervisor), shutdown.clone())
            .expect("context");
        let handle = thread::spawn(move || TaskLoop::new(ctx, Recorder::default()).run());
        thread::sleep(Duration::from_millis(30));
        shutdown.trigger();
        handle
            .join()
            .expect("task thread panicked")
            .expect("task faulted");
    }
}
