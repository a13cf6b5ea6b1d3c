use std::path::Path;

use flight_dispatch::{logging, sim};

fn print_usage(program: &str) {
    println!("Flight dispatch CLI");
    println!("Usage:");
    println!("  {program} (run demo)");
    println!("  {program} demo [config.toml]");
    println!("  {program} bench [producers] [commands_per_producer] [capacity]");
    println!("  {program} --help");
    println!();
    println!("The demo makes one synchronous call between two tasks, then lets a");
    println!("third task stall until the watchdog resets the system.");
    println!("Defaults:");
    println!("  bench  producers=4 commands_per_producer=10000 capacity=16");
    println!("Logging:");
    println!("  RUST_LOG=debug|info|warn selects log verbosity (written to stderr)");
}

fn exit_with_usage(program: &str, message: &str) -> ! {
    eprintln!("{message}");
    print_usage(program);
    std::process::exit(2);
}

fn parse_count(program: &str, name: &str, arg: Option<String>) -> Option<usize> {
    let arg = arg?;
    match arg.parse::<usize>() {
        Ok(value) => Some(value),
        Err(_) => exit_with_usage(program, &format!("bench: invalid {name} value: {arg}")),
    }
}

fn main() {
    logging::init();
    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "flight_dispatch".to_string());
    let mut args = std::env::args().skip(1);
    let result = match args.next().as_deref() {
        Some("bench") => {
            let producers = parse_count(&program, "producers", args.next());
            let commands = parse_count(&program, "commands_per_producer", args.next());
            let capacity = parse_count(&program, "capacity", args.next());
            if let Some(extra) = args.next() {
                exit_with_usage(&program, &format!("bench: unexpected argument: {extra}"));
            }
            sim::run_benchmark(producers, commands, capacity)
        }
        Some("demo") => {
            let config = args.next();
            if let Some(extra) = args.next() {
                exit_with_usage(&program, &format!("demo: unexpected argument: {extra}"));
            }
            sim::run_demo(config.as_deref().map(Path::new))
        }
        Some("--help") | Some("-h") | Some("help") => {
            print_usage(&program);
            Ok(())
        }
        Some(other) => exit_with_usage(&program, &format!("unknown command: {other}")),
        None => sim::run_demo(None),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
