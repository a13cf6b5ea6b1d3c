//! Whole-system scenarios run on real threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use flight_dispatch::config::{SystemConfig, TaskConfig};
use flight_dispatch::error::CommandError;
use flight_dispatch::registry::LivenessState;
use flight_dispatch::sim::{self, CallProbe, Requester, Responder, Stalled};
use flight_dispatch::watchdog::SimulatedWatchdog;
use flight_dispatch::{Command, CommandHandler, FaultKind, SystemBuilder, TaskContext};

fn task(name: &str) -> TaskConfig {
    TaskConfig {
        max_block_ms: 20,
        quantum_ms: 10,
        checkin_interval_ms: 50,
        deadline_ms: 250,
        ..TaskConfig::named(name)
    }
}

fn config(tasks: Vec<TaskConfig>) -> SystemConfig {
    let mut cfg = SystemConfig::default();
    cfg.supervisor.poll_ms = 20;
    cfg.supervisor.grace_ms = 100;
    cfg.sync_call_timeout_ms = 200;
    cfg.tasks = tasks;
    cfg
}

#[test]
fn sync_call_completes_before_timeout() {
    let probe = Arc::new(CallProbe::default());
    let handled = Arc::new(AtomicUsize::new(0));
    let system = SystemBuilder::new(config(vec![task(sim::REQUESTER), task(sim::RESPONDER)]))
        .handler(
            sim::REQUESTER,
            Requester::new(Duration::from_millis(200), Arc::clone(&probe)),
        )
        .handler(
            sim::RESPONDER,
            Responder::new(Duration::from_millis(50), Arc::clone(&handled)),
        )
        .start()
        .expect("start");

    thread::sleep(Duration::from_millis(400));
    let report = system.stop();

    let latency = probe
        .outcome()
        .expect("call made")
        .expect("call succeeded");
    assert!(latency >= Duration::from_millis(50));
    assert!(latency < Duration::from_millis(200));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(report.reset.is_none());
    assert!(report.failed_tasks().is_empty());
}

#[test]
fn slow_responder_times_out_and_resets() {
    let probe = Arc::new(CallProbe::default());
    let mut cfg = config(vec![task(sim::REQUESTER), task(sim::RESPONDER)]);
    cfg.tasks[1].deadline_ms = 2000;
    let system = SystemBuilder::new(cfg)
        .handler(
            sim::REQUESTER,
            Requester::new(Duration::from_millis(50), Arc::clone(&probe)),
        )
        .handler(
            sim::RESPONDER,
            Responder::new(Duration::from_millis(300), Arc::default()),
        )
        .start()
        .expect("start");

    assert!(system.wait_for_reset(Duration::from_secs(2)));
    let report = system.join();
    let fault = probe.outcome().expect("call made").expect_err("call timed out");
    assert_eq!(fault.kind(), FaultKind::SyncCall);
    assert_eq!(report.reset.map(|f| f.kind()), Some(FaultKind::SyncCall));
    assert_eq!(report.faults.len(), 1);
}

#[test]
fn stalled_task_fails_and_resets_exactly_once() {
    let hw = Arc::new(SimulatedWatchdog::new());
    let mut slow = task("second_staller");
    slow.deadline_ms = 400;
    let system = SystemBuilder::new(config(vec![task(sim::STALLED), slow, task("steady")]))
        .hardware_watchdog(hw.clone())
        .handler(sim::STALLED, Stalled::after(2))
        .handler("second_staller", Stalled::after(2))
        .handler("steady", Responder::new(Duration::ZERO, Arc::default()))
        .start()
        .expect("start");

    assert!(system.wait_for_reset(Duration::from_secs(3)));
    let resets = Arc::clone(system.resets());
    let report = system.join();

    assert_eq!(hw.kicks(), 1);
    assert!(hw.pets() > 0);
    assert_eq!(report.failed_tasks(), vec![sim::STALLED]);
    assert!(report.liveness.contains(&("steady".to_string(), LivenessState::Healthy)));
    assert!(resets.reset_requested());
    assert_eq!(report.reset.map(|f| f.kind()), Some(FaultKind::Liveness));
}

struct Echo;

impl CommandHandler for Echo {
    fn execute(&mut self, _ctx: &TaskContext, cmd: &mut Command) -> Result<(), CommandError> {
        if cmd.operation == 7 {
            return Err(CommandError::Failed("seven is unlucky".into()));
        }
        Ok(())
    }
}

#[test]
fn command_failure_is_reported_not_fatal() {
    let system = SystemBuilder::new(config(vec![task("echo")]))
        .handler("echo", Echo)
        .start()
        .expect("start");
    let echo = system.registry().lookup("echo").expect("echo");
    system
        .dispatcher()
        .enqueue(Command::new(echo, 7))
        .expect("enqueue");
    thread::sleep(Duration::from_millis(150));
    let report = system.stop();
    assert!(report.reset.is_none());
    assert!(report.faults.is_empty());
}

#[test]
fn demo_run_matches_scenario() {
    let outcome = sim::run_demo_with(sim::demo_config()).expect("demo");
    assert!(matches!(outcome.sync_call, Some(Ok(_))));
    assert_eq!(outcome.handoffs, 1);
    assert_eq!(outcome.resets, 1);
    assert_eq!(outcome.report.failed_tasks(), vec![sim::STALLED]);
}
