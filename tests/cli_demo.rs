//! CLI integration tests for the demo and bench modes.

use std::io::Write;
use std::process::Command;

fn summary_value<'a>(stdout: &'a str, key: &str) -> &'a str {
    let prefix = format!("{key}=");
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .unwrap_or_else(|| panic!("{key} line missing"))
        .trim()
}

#[test]
fn demo_cli_reports_sync_call_and_single_reset() {
    let bin = env!("CARGO_BIN_EXE_flight_dispatch");
    // Run the demo binary with default settings.
    let output = Command::new(bin)
        .output()
        .expect("failed to run demo binary");

    assert!(
        output.status.success(),
        "demo exited with non-zero status: {:?}",
        output.status
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("DEMO SUMMARY"),
        "demo summary missing from output"
    );
    assert_eq!(summary_value(&stdout, "sync_call"), "ok");
    assert_eq!(summary_value(&stdout, "handoffs_handled"), "1");

    // The stalled task is detected and the system resets exactly once.
    assert_eq!(summary_value(&stdout, "reset_count"), "1");
    assert_eq!(summary_value(&stdout, "failed_tasks"), "[\"stalled\"]");
}

#[test]
fn demo_cli_accepts_config_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"
sync_call_timeout_ms = 250

[supervisor]
poll_ms = 20
grace_ms = 50

[[task]]
name = "requester"
max_block_ms = 20
quantum_ms = 10
checkin_interval_ms = 50
deadline_ms = 300

[[task]]
name = "responder"
max_block_ms = 20
quantum_ms = 10
checkin_interval_ms = 50
deadline_ms = 300
"#
    )
    .expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_flight_dispatch"))
        .arg("demo")
        .arg(file.path())
        .output()
        .expect("failed to run demo binary");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(summary_value(&stdout, "sync_call"), "ok");
    // Nothing stalls, so nothing resets.
    assert_eq!(summary_value(&stdout, "reset_count"), "0");
    assert_eq!(summary_value(&stdout, "failed_tasks"), "[]");
}

#[test]
fn invalid_config_exits_with_error() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "[[task]]\nname = \"Watchdog\"\n").expect("write config");
    let output = Command::new(env!("CARGO_BIN_EXE_flight_dispatch"))
        .arg("demo")
        .arg(file.path())
        .output()
        .expect("failed to run binary");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("reserved"));
}

#[test]
fn bench_cli_prints_csv() {
    let output = Command::new(env!("CARGO_BIN_EXE_flight_dispatch"))
        .args(["bench", "2", "500", "8"])
        .output()
        .expect("failed to run bench");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    let header = lines.next().expect("csv header");
    assert!(header.starts_with("producers,commands_per_producer,capacity,total_commands"));
    let row: Vec<&str> = lines.next().expect("csv row").split(',').collect();
    assert_eq!(&row[..4], ["2", "500", "8", "1000"]);
}

#[test]
fn unknown_command_prints_usage() {
    let output = Command::new(env!("CARGO_BIN_EXE_flight_dispatch"))
        .arg("fly")
        .output()
        .expect("failed to run binary");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Usage:"));
}
