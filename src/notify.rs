//! One-shot notification slots and the synchronous call built on them.
//!
//! A caller arms its private slot, attaches a [`Continuation`] to the command,
//! dispatches it, and blocks on the slot. The target signals the continuation
//! once the command reaches a terminal state. Each arming bumps the slot's
//! generation, so a signal for a call that already timed out can never
//! satisfy a later call on the same slot.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::SyncCallError;
use crate::types::{Command, Completion};

struct SlotState {
    generation: u64,
    armed: bool,
    value: Option<Completion>,
}

/// Binary, self-clearing notification owned by one waiting task.
pub struct Notification {
    state: Mutex<SlotState>,
    signalled: Condvar,
}

impl Notification {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                generation: 0,
                armed: false,
                value: None,
            }),
            signalled: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a call is currently waiting on this slot.
    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// Prepare the slot for one call.
    pub fn arm(self: &Arc<Self>) -> Result<Continuation, SyncCallError> {
        let mut guard = self.lock();
        if guard.armed {
            return Err(SyncCallError::SlotBusy);
        }
        guard.generation += 1;
        guard.armed = true;
        guard.value = None;
        Ok(Continuation {
            slot: Arc::clone(self),
            generation: guard.generation,
        })
    }

    fn disarm(&self) {
        let mut guard = self.lock();
        guard.armed = false;
        guard.value = None;
    }

    /// Wait for the signal, clearing it; `None` once `timeout` has fully
    /// elapsed. Either way the slot is free again afterwards.
    pub fn take(&self, timeout: Duration) -> Option<Completion> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(value) = guard.value.take() {
                guard.armed = false;
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                guard.armed = false;
                return None;
            }
            let (next, _) = self
                .signalled
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard = next;
        }
    }
}

/// Reference to an armed slot, carried by a command.
#[derive(Clone)]
pub struct Continuation {
    slot: Arc<Notification>,
    generation: u64,
}

impl Continuation {
    /// Deliver the outcome; false if the waiter already gave up or the slot
    /// was re-armed for another call.
    pub fn signal(&self, outcome: Completion) -> bool {
        let mut guard = self.slot.lock();
        if !guard.armed || guard.generation != self.generation || guard.value.is_some() {
            return false;
        }
        guard.value = Some(outcome);
        self.slot.signalled.notify_one();
        true
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Send `cmd` and block until its target signals completion or `timeout`
/// elapses.
///
/// A timeout is reported, never retried; whether the caller retries is its
/// own decision.
pub fn call(
    dispatcher: &Dispatcher,
    mut cmd: Command,
    slot: &Arc<Notification>,
    timeout: Duration,
) -> Result<(), SyncCallError> {
    let continuation = slot.arm()?;
    cmd.requires_ack = true;
    cmd.set_continuation(continuation);
    let target = cmd.target;
    let operation = cmd.operation;

    if let Err(err) = dispatcher.enqueue(cmd) {
        slot.disarm();
        return Err(err.into());
    }
    debug!(
        "sync call: waiting on {} for operation {operation}",
        dispatcher.registry().name_of(target)
    );

    match slot.take(timeout) {
        Some(Completion::Completed) => Ok(()),
        Some(Completion::Failed) => Err(SyncCallError::Failed { target, operation }),
        None => {
            warn!(
                "sync call: {} did not complete operation {operation} within {timeout:?}",
                dispatcher.registry().name_of(target)
            );
            Err(SyncCallError::Timeout {
                target,
                operation,
                waited: timeout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use crate::registry::tests::spec;
    use crate::types::TaskId;
    use std::thread;

    fn setup() -> (Dispatcher, TaskId) {
        let mut builder = RegistryBuilder::new();
        let b = builder.register(spec("B")).expect("register");
        (Dispatcher::new(builder.build()), b)
    }

    /// Stand-in for the target task: pops one command and signals it.
    fn serve_one(
        dispatcher: &Dispatcher,
        b: TaskId,
        delay: Duration,
        outcome: Completion,
    ) -> thread::JoinHandle<()> {
        let registry = Arc::clone(dispatcher.registry());
        thread::spawn(move || {
            let queue = registry.get(b).expect("entry").queue();
            let mut cmd = queue.receive(Duration::from_secs(5)).expect("command");
            thread::sleep(delay);
            let continuation = cmd.take_continuation().expect("continuation");
            assert!(continuation.signal(outcome));
        })
    }

    #[test]
    fn call_returns_when_target_signals() {
        let (dispatcher, b) = setup();
        let slot = Notification::new();
        let server = serve_one(&dispatcher, b, Duration::from_millis(20), Completion::Completed);

        let start = Instant::now();
        call(&dispatcher, Command::new(b, 5), &slot, Duration::from_secs(5)).expect("call");
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!slot.is_armed());
        server.join().expect("server panicked");
    }

    #[test]
    fn call_reports_target_failure() {
        let (dispatcher, b) = setup();
        let slot = Notification::new();
        let server = serve_one(&dispatcher, b, Duration::ZERO, Completion::Failed);
        let err = call(&dispatcher, Command::new(b, 5), &slot, Duration::from_secs(5))
            .expect_err("failed command reported success");
        assert_eq!(err, SyncCallError::Failed { target: b, operation: 5 });
        server.join().expect("server panicked");
    }

    #[test]
    fn call_times_out_no_earlier_than_configured() {
        let (dispatcher, b) = setup();
        let slot = Notification::new();
        let timeout = Duration::from_millis(60);
        let start = Instant::now();
        let err = call(&dispatcher, Command::new(b, 5), &slot, timeout).expect_err("no signal");
        assert!(start.elapsed() >= timeout);
        assert!(matches!(err, SyncCallError::Timeout { operation: 5, .. }));
        assert!(!slot.is_armed());
    }

    #[test]
    fn late_signal_does_not_satisfy_next_call() {
        let (dispatcher, b) = setup();
        let slot = Notification::new();
        call(&dispatcher, Command::new(b, 1), &slot, Duration::from_millis(10))
            .expect_err("no one served the first call");

        let queue = dispatcher.registry().get(b).expect("entry").queue();
        let mut stale = queue.try_receive().expect("first command");
        let stale_continuation = stale.take_continuation().expect("continuation");

        let _second = slot.arm().expect("slot free after timeout");
        assert!(!stale_continuation.signal(Completion::Completed));
        assert_eq!(slot.take(Duration::from_millis(10)), None);
    }

    #[test]
    fn armed_slot_rejects_second_call() {
        let (dispatcher, b) = setup();
        let slot = Notification::new();
        let _pending = slot.arm().expect("arm");
        assert_eq!(
            call(&dispatcher, Command::new(b, 5), &slot, Duration::from_millis(10)),
            Err(SyncCallError::SlotBusy)
        );
        // The rejected call never reached the queue.
        assert!(dispatcher.registry().get(b).expect("entry").queue().is_empty());
    }

    #[test]
    fn dispatch_failure_frees_slot() {
        let (dispatcher, b) = setup();
        dispatcher.registry().set_enabled(b, false);
        let slot = Notification::new();
        let err = call(&dispatcher, Command::new(b, 5), &slot, Duration::from_millis(10))
            .expect_err("disabled target");
        assert!(matches!(err, SyncCallError::Dispatch(_)));
        assert!(!slot.is_armed());
    }

    #[test]
    fn continuation_signals_once() {
        let slot = Notification::new();
        let continuation = slot.arm().expect("arm");
        assert!(continuation.signal(Completion::Completed));
        assert!(!continuation.signal(Completion::Failed));
        assert_eq!(slot.take(Duration::ZERO), Some(Completion::Completed));
    }
}
