//! Demo and benchmark runners for the flight dispatch layer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::{SystemConfig, TaskConfig};
use crate::error::{CommandError, DispatchError, Fault, StartError};
use crate::notify::Notification;
use crate::system::{SystemBuilder, SystemReport};
use crate::task_loop::{CommandHandler, TaskContext};
use crate::types::{Command, Payload, ops};
use crate::watchdog::SimulatedWatchdog;

pub const REQUESTER: &str = "requester";
pub const RESPONDER: &str = "responder";
pub const STALLED: &str = "stalled";

const HANDOFF_MESSAGE: &[u8] = b"test 2 says hi!";
// Extra time allowed beyond the worst-case detection window before giving up.
const RESET_WAIT_SLACK_MS: u64 = 2000;
// How long a demo without a stalled task runs before stopping.
const IDLE_RUN_MS: u64 = 500;

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    // SAFETY: rusage is plain data; all-zero is a valid value.
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let secs = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Some((secs(usage.ru_utime), secs(usage.ru_stime)))
}

#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// What the requester saw of its synchronous call.
#[derive(Debug, Default)]
pub struct CallProbe {
    outcome: Mutex<Option<Result<Duration, Fault>>>,
}

impl CallProbe {
    pub fn outcome(&self) -> Option<Result<Duration, Fault>> {
        self.outcome
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn record(&self, outcome: Result<Duration, Fault>) {
        *self.outcome.lock().unwrap_or_else(|p| p.into_inner()) = Some(outcome);
    }
}

fn accept_application_ops(cmd: &Command) -> Result<(), CommandError> {
    if ops::is_reserved(cmd.operation) {
        return Err(CommandError::Unsupported(cmd.operation));
    }
    Ok(())
}

/// Hands one unit of work to the responder with a synchronous call on its
/// first iteration, then idles.
pub struct Requester {
    slot: Arc<Notification>,
    timeout: Duration,
    probe: Arc<CallProbe>,
    called: bool,
}

impl Requester {
    pub fn new(timeout: Duration, probe: Arc<CallProbe>) -> Self {
        Self {
            slot: Notification::new(),
            timeout,
            probe,
            called: false,
        }
    }
}

impl CommandHandler for Requester {
    fn execute(&mut self, _ctx: &TaskContext, cmd: &mut Command) -> Result<(), CommandError> {
        accept_application_ops(cmd)
    }

    fn after_drain(&mut self, ctx: &TaskContext) -> Result<(), Fault> {
        if self.called {
            return Ok(());
        }
        self.called = true;
        let Some(responder) = ctx.registry().lookup(RESPONDER) else {
            let fault = Fault::Routing {
                task: ctx.id(),
                source: DispatchError::UnknownTarget(ctx.id()),
            };
            warn!("{}: no {RESPONDER} task configured", ctx.name());
            self.probe.record(Err(fault.clone()));
            return Err(fault);
        };

        let cmd = Command::new(responder, ops::PROCESSING_HANDOFF)
            .with_payload(Payload::Bytes(Arc::from(HANDOFF_MESSAGE)));
        let start = Instant::now();
        let result = ctx.call(cmd, &self.slot, self.timeout);
        let elapsed = start.elapsed();
        self.probe.record(result.clone().map(|()| elapsed));
        if result.is_ok() {
            info!("{}: handoff completed in {elapsed:?}", ctx.name());
        }
        result
    }
}

/// Performs handoffs it receives; each one takes `work` to process.
pub struct Responder {
    work: Duration,
    handled: Arc<AtomicUsize>,
}

impl Responder {
    pub fn new(work: Duration, handled: Arc<AtomicUsize>) -> Self {
        Self { work, handled }
    }
}

impl CommandHandler for Responder {
    fn execute(&mut self, ctx: &TaskContext, cmd: &mut Command) -> Result<(), CommandError> {
        if cmd.operation != ops::PROCESSING_HANDOFF {
            return accept_application_ops(cmd);
        }
        if let Payload::Bytes(bytes) = &cmd.payload {
            info!(
                "{}: handoff from {:?}: {}",
                ctx.name(),
                cmd.source,
                String::from_utf8_lossy(bytes)
            );
        }
        thread::sleep(self.work);
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Runs normally for a few iterations, then hangs without checking in until
/// the system shuts down.
pub struct Stalled {
    healthy_iterations: usize,
    iterations: usize,
}

impl Stalled {
    pub fn after(healthy_iterations: usize) -> Self {
        Self {
            healthy_iterations,
            iterations: 0,
        }
    }
}

impl CommandHandler for Stalled {
    fn execute(&mut self, _ctx: &TaskContext, cmd: &mut Command) -> Result<(), CommandError> {
        accept_application_ops(cmd)
    }

    fn after_drain(&mut self, ctx: &TaskContext) -> Result<(), Fault> {
        self.iterations += 1;
        if self.iterations <= self.healthy_iterations {
            return Ok(());
        }
        warn!("{}: stalling", ctx.name());
        while !ctx.shutdown().is_triggered() {
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

/// Three tasks on short timings so the whole demo finishes in about a second.
pub fn demo_config() -> SystemConfig {
    let fast = |name: &str| TaskConfig {
        max_block_ms: 50,
        quantum_ms: 20,
        checkin_interval_ms: 100,
        deadline_ms: 400,
        ..TaskConfig::named(name)
    };
    let mut cfg = SystemConfig::default();
    cfg.supervisor.poll_ms = 50;
    cfg.supervisor.quantum_ms = 10;
    cfg.supervisor.grace_ms = 200;
    cfg.sync_call_timeout_ms = 300;
    cfg.tasks = vec![fast(REQUESTER), fast(RESPONDER), fast(STALLED)];
    cfg
}

/// Results gathered from one demo run.
#[derive(Debug)]
pub struct DemoOutcome {
    pub tasks: usize,
    pub sync_call: Option<Result<Duration, Fault>>,
    pub handoffs: usize,
    pub resets: u64,
    pub pets: u64,
    pub report: SystemReport,
}

/// Start the configured tasks, let the stalled one (if any) trip the
/// supervisor, and collect the results.
pub fn run_demo_with(config: SystemConfig) -> Result<DemoOutcome, StartError> {
    let hw = Arc::new(SimulatedWatchdog::new());
    let probe = Arc::new(CallProbe::default());
    let handoffs = Arc::new(AtomicUsize::new(0));

    let mut builder = SystemBuilder::new(config.clone()).hardware_watchdog(hw.clone());
    for task in config.tasks.iter().filter(|task| task.enabled) {
        builder = match task.name.as_str() {
            REQUESTER => builder.handler(
                &task.name,
                Requester::new(config.sync_call_timeout(), Arc::clone(&probe)),
            ),
            STALLED => builder.handler(&task.name, Stalled::after(3)),
            _ => builder.handler(
                &task.name,
                Responder::new(Duration::from_millis(100), Arc::clone(&handoffs)),
            ),
        };
    }

    let system = builder.start()?;
    let stalls = config
        .task(STALLED)
        .is_some_and(|task| task.enabled && task.monitored);
    if stalls {
        let window = config
            .tasks
            .iter()
            .map(|task| task.max_block_ms + task.quantum_ms + task.deadline_ms)
            .max()
            .unwrap_or(0);
        let bound = window + config.supervisor.grace_ms + config.supervisor.poll_ms * 2;
        if !system.wait_for_reset(Duration::from_millis(bound + RESET_WAIT_SLACK_MS)) {
            warn!("stalled task was not detected within {bound}ms");
        }
    } else {
        thread::sleep(Duration::from_millis(IDLE_RUN_MS));
    }
    let report = system.stop();

    Ok(DemoOutcome {
        tasks: config.tasks.len(),
        sync_call: probe.outcome(),
        handoffs: handoffs.load(Ordering::SeqCst),
        resets: hw.kicks(),
        pets: hw.pets(),
        report,
    })
}

/// Run the demo from the built-in timings or a TOML file and print a summary.
pub fn run_demo(config: Option<&Path>) -> Result<(), StartError> {
    let config = match config {
        Some(path) => SystemConfig::load(path)?,
        None => demo_config(),
    };
    let start = Instant::now();
    let outcome = run_demo_with(config)?;
    info!("demo finished in {}ms", start.elapsed().as_millis());

    println!("DEMO SUMMARY");
    println!("tasks={}", outcome.tasks);
    match &outcome.sync_call {
        Some(Ok(latency)) => {
            println!("sync_call=ok");
            println!("sync_call_latency_ms={}", latency.as_millis());
        }
        Some(Err(fault)) => println!("sync_call=failed ({fault})"),
        None => println!("sync_call=skipped"),
    }
    println!("handoffs_handled={}", outcome.handoffs);
    println!("reset_count={}", outcome.resets);
    match &outcome.report.reset {
        Some(fault) => println!("reset_reason={fault}"),
        None => println!("reset_reason=none"),
    }
    println!("failed_tasks={:?}", outcome.report.failed_tasks());
    println!("watchdog_pets={}", outcome.pets);
    println!("undelivered_commands={}", outcome.report.undelivered);
    Ok(())
}

/// Counts what it receives.
struct Sink {
    handled: Arc<AtomicUsize>,
}

impl CommandHandler for Sink {
    fn execute(&mut self, _ctx: &TaskContext, _cmd: &mut Command) -> Result<(), CommandError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Aggregated metrics from a single benchmark run.
struct BenchResult {
    producers: usize,
    commands_per_producer: usize,
    capacity: usize,
    total_commands: usize,
    elapsed_ms: f64,
    throughput: f64,
    full_retries: usize,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    lost: usize,
}

fn benchmark_once(
    producers: usize,
    commands_per_producer: usize,
    capacity: usize,
) -> Result<BenchResult, StartError> {
    let mut cfg = SystemConfig::default();
    cfg.supervisor.poll_ms = 100;
    cfg.tasks = vec![TaskConfig {
        monitored: false,
        queue_capacity: capacity,
        max_block_ms: 5,
        quantum_ms: 0,
        ..TaskConfig::named("sink")
    }];
    let handled = Arc::new(AtomicUsize::new(0));
    let system = SystemBuilder::new(cfg)
        .handler(
            "sink",
            Sink {
                handled: Arc::clone(&handled),
            },
        )
        .start()?;
    let Some(sink) = system.registry().lookup("sink") else {
        system.stop();
        return Err(StartError::MissingHandler("sink".to_string()));
    };

    let total_commands = producers * commands_per_producer;
    let full_retries = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicBool::new(false));
    let cpu_start = cpu_times_seconds();
    let start = Instant::now();

    let mut handles = Vec::new();
    for producer in 0..producers {
        let dispatcher = system.dispatcher().clone();
        let full_retries = Arc::clone(&full_retries);
        let producer_failed = Arc::clone(&failed);
        let spawned = thread::Builder::new()
            .name(format!("producer-{producer}"))
            .spawn(move || {
                for op in 0..commands_per_producer {
                    loop {
                        match dispatcher.enqueue(Command::new(sink, op as i32)) {
                            Ok(()) => break,
                            Err(DispatchError::QueueFull { .. }) => {
                                full_retries.fetch_add(1, Ordering::Relaxed);
                                thread::yield_now();
                            }
                            Err(err) => {
                                warn!("producer-{producer}: {err}");
                                producer_failed.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                warn!("failed to spawn producer-{producer}: {err}");
                failed.store(true, Ordering::SeqCst);
            }
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            failed.store(true, Ordering::SeqCst);
        }
    }
    while !failed.load(Ordering::SeqCst) && handled.load(Ordering::SeqCst) < total_commands {
        thread::sleep(Duration::from_micros(200));
    }

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };
    system.stop();

    let throughput = if elapsed_ms > 0.0 {
        total_commands as f64 / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    Ok(BenchResult {
        producers,
        commands_per_producer,
        capacity,
        total_commands,
        elapsed_ms,
        throughput,
        full_retries: full_retries.load(Ordering::SeqCst),
        cpu_user_s,
        cpu_sys_s,
        lost: total_commands.saturating_sub(handled.load(Ordering::SeqCst)),
    })
}

/// Run a single dispatch benchmark with optional parameter overrides and
/// print it as CSV.
pub fn run_benchmark(
    producers: Option<usize>,
    commands_per_producer: Option<usize>,
    capacity: Option<usize>,
) -> Result<(), StartError> {
    let producers = producers.unwrap_or(4);
    let commands_per_producer = commands_per_producer.unwrap_or(10_000);
    let capacity = capacity.unwrap_or(16);
    if producers == 0 {
        eprintln!("benchmark error: producers must be > 0");
        return Ok(());
    }
    if commands_per_producer == 0 {
        eprintln!("benchmark error: commands_per_producer must be > 0");
        return Ok(());
    }
    let result = benchmark_once(producers, commands_per_producer, capacity)?;

    let na = |v: Option<f64>| v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "NA".to_string());
    println!(
        "producers,commands_per_producer,capacity,total_commands,elapsed_ms,throughput_cmds_per_s,queue_full_retries,cpu_user_s,cpu_sys_s"
    );
    println!(
        "{},{},{},{},{:.2},{:.2},{},{},{}",
        result.producers,
        result.commands_per_producer,
        result.capacity,
        result.total_commands,
        result.elapsed_ms,
        result.throughput,
        result.full_retries,
        na(result.cpu_user_s),
        na(result.cpu_sys_s),
    );
    if result.lost > 0 {
        eprintln!("# warning,lost_commands,{}", result.lost);
    }
    Ok(())
}
