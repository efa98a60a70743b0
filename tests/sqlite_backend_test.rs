mod common;

use pretty_assertions::assert_eq;
use stmt_handoff::client::SqliteClient;
use stmt_handoff::harness::Role;
use stmt_handoff::{Coordinator, HarnessError, Operation, RunConfig};
use tempfile::TempDir;

use common::{RUN_TIMEOUT, run_with_timeout};

fn seeded_client(dir: &TempDir, rows: usize) -> SqliteClient {
    let path = dir.path().join("handoff.db");
    let client = SqliteClient::new(path.to_string_lossy().into_owned());
    client.seed(rows).expect("seed database");
    client
}

#[test]
fn test_sqlite_run_fetches_seeded_rows() {
    let dir = TempDir::new().unwrap();
    let client = seeded_client(&dir, 10);

    let config = RunConfig::new("localhost", 0, 20, 4);
    let coordinator = Coordinator::new(client, config);
    let (_, outcome) = run_with_timeout(coordinator, RUN_TIMEOUT);
    let summary = outcome.expect("sqlite run should succeed");

    for report in summary.reports().iter().filter(|r| r.role == Role::Executor) {
        assert_eq!(report.rows_fetched, report.completed as u64 * 10);
    }
    assert_eq!(summary.reports().len(), 4);
}

#[test]
fn test_sqlite_rows_outside_window_are_not_fetched() {
    let dir = TempDir::new().unwrap();
    let client = seeded_client(&dir, 5);

    let config = RunConfig::new("localhost", 0, 6, 2)
        .with_query("SELECT name, time, value FROM tag WHERE name = 'TAG_01'");
    let coordinator = Coordinator::new(client, config);
    let (_, outcome) = run_with_timeout(coordinator, RUN_TIMEOUT);
    let summary = outcome.unwrap();
    assert_eq!(summary.rows_fetched(), 0);
}

#[test]
fn test_sqlite_bad_query_is_prepare_fault() {
    let dir = TempDir::new().unwrap();
    let client = seeded_client(&dir, 1);

    let config = RunConfig::new("localhost", 0, 5, 3).with_query("SELECT * FROM no_such_table");
    let coordinator = Coordinator::new(client, config);
    let (_, outcome) = run_with_timeout(coordinator, RUN_TIMEOUT);

    let err = outcome.expect_err("preparing against a missing table must fail");
    match &err {
        HarnessError::Protocol { op, source, .. } => {
            assert_eq!(*op, Operation::Prepare);
            assert!(source.message.contains("no_such_table"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.exit_code(), 1);
}
