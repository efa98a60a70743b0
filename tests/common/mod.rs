use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use stmt_handoff::client::{StubClient, StubConfig};
use stmt_handoff::{Coordinator, DbClient, HarnessError, RunConfig, RunSummary};

/// Generous bound for runs that must not deadlock.
#[allow(dead_code)]
pub const RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Run configuration against a fake endpoint; the stub ignores host and port.
#[allow(dead_code)]
pub fn stub_run_config(thread_count: usize, test_num: usize) -> RunConfig {
    RunConfig::new("localhost", 5656, test_num, thread_count)
}

/// Stub client with a small random delay inside every call, to shuffle interleavings.
#[allow(dead_code)]
pub fn jittery_stub() -> StubClient {
    StubClient::new(StubConfig {
        jitter: Some(Duration::from_micros(200)),
        ..StubConfig::default()
    })
}

/// Run `coordinator` on a separate thread and fail the test if it does not finish in time.
/// Returns the coordinator alongside the outcome so tests can inspect the client afterwards.
#[allow(dead_code)]
pub fn run_with_timeout<C>(
    coordinator: Coordinator<C>,
    timeout: Duration,
) -> (Coordinator<C>, Result<RunSummary, HarnessError>)
where
    C: DbClient + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let outcome = coordinator.run();
        let _ = tx.send((coordinator, outcome));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => panic!("run did not finish within {timeout:?}; workers are deadlocked"),
    }
}
