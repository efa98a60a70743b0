use std::process::{Command, Output};

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stmt-handoff"))
        .args(args)
        .output()
        .expect("failed to launch stmt-handoff")
}

#[test]
fn test_stub_run_prints_one_line_per_thread() {
    let output = run_cli(&["localhost", "5656", "50", "3", "0", "--backend", "stub"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    for (i, line) in lines.iter().enumerate() {
        let prefix = format!("thread {i} elapsed time between first execute and barrier: ");
        assert!(line.starts_with(&prefix), "unexpected line: {line}");
        let seconds = line[prefix.len()..].trim_end_matches(" sec");
        assert!(seconds.parse::<f64>().is_ok(), "not a number: {seconds}");
        assert_eq!(seconds.split('.').nth(1).map(str::len), Some(6));
    }
}

#[test]
fn test_print_rows_emits_header_and_rows() {
    let output = run_cli(&["localhost", "5656", "2", "2", "1", "--backend", "stub"]);
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("NAME"));
    assert!(stdout.contains("TAG_00"));
    assert!(stdout.lines().any(|l| l.starts_with(&"-".repeat(80))));
}

#[test]
fn test_single_thread_is_usage_error() {
    let output = run_cli(&["localhost", "5656", "10", "1", "0", "--backend", "stub"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("thread_count must be >= 2"), "stderr: {stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn test_missing_arguments_is_usage_error() {
    let output = run_cli(&["localhost", "5656"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_injected_prepare_failure_exits_with_diagnostic() {
    let output = run_cli(&[
        "localhost",
        "5656",
        "100",
        "2",
        "0",
        "--backend",
        "stub",
        "--stub-fail-prepare-after",
        "3",
    ]);
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr
            .lines()
            .any(|l| l.starts_with("ERROR : (Prepare) bundle 1: [STUB] injected prepare failure")),
        "stderr: {stderr}"
    );
    // No timing report for a failed run.
    assert!(output.stdout.is_empty());
}
