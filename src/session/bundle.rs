use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::client::{ClientError, DbClient, Row};
use crate::{HarnessError, Operation, Result};

/// The client handles a bundle owns. Both slots are empty until the owning worker opens
/// the bundle and again after it tears the bundle down.
pub struct Handles<S, T> {
    session: Option<S>,
    statement: Option<T>,
}

impl<S, T> Default for Handles<S, T> {
    fn default() -> Self {
        Self {
            session: None,
            statement: None,
        }
    }
}

#[derive(Debug, Default)]
struct VersionState {
    counter: u64,
    closed: bool,
}

/// Result of waiting for a prepared version newer than the caller's last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// A newer version was published; the value is the counter at wake-up.
    Fresh(u64),
    /// The stream was closed and nothing newer will ever be published.
    Exhausted,
}

/// One session/statement pair plus the state other threads need to use it.
///
/// `access` owns the handles, so every prepare and execute/fetch goes through that lock.
/// `version` together with `version_ready` carries the publish/subscribe handshake between
/// preparers and executors. Once `halted` is set, under the access lock when a call on this
/// bundle fails, no further prepare or execute is issued on it.
pub struct ResourceBundle<C: DbClient> {
    slot: usize,
    access: Mutex<Handles<C::Session, C::Statement>>,
    halted: AtomicBool,
    version: Mutex<VersionState>,
    version_ready: Condvar,
}

impl<C: DbClient> ResourceBundle<C> {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            access: Mutex::new(Handles::default()),
            halted: AtomicBool::new(false),
            version: Mutex::new(VersionState::default()),
            version_ready: Condvar::new(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Connect and allocate the statement. Called only by the worker owning this slot.
    pub fn open(&self, client: &C, host: &str, port: u16) -> Result<()> {
        let mut handles = self.access.lock();

        let mut session = client
            .connect(host, port)
            .map_err(|source| self.setup_fault(Operation::Connect, source))?;

        let statement = match client.alloc_statement(&mut session) {
            Ok(statement) => statement,
            Err(source) => {
                if let Err(e) = client.disconnect(session) {
                    warn!("Disconnect after failed allocation on bundle {}: {}", self.slot, e);
                }
                return Err(self.setup_fault(Operation::AllocStmt, source));
            }
        };

        handles.session = Some(session);
        handles.statement = Some(statement);
        debug!("Bundle {} opened via {}", self.slot, client.name());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        let handles = self.access.lock();
        handles.session.is_some() || handles.statement.is_some()
    }

    /// Prepare `sql` on this bundle's statement while holding the access lock.
    pub fn prepare(&self, client: &C, sql: &str) -> Result<()> {
        let mut guard = self.access.lock();
        if self.is_halted() {
            return Err(HarnessError::Aborted);
        }
        let handles = &mut *guard;
        let (Some(session), Some(statement)) =
            (handles.session.as_mut(), handles.statement.as_mut())
        else {
            return Err(self.protocol_fault(Operation::Prepare, not_open()));
        };

        client.prepare(session, statement, sql).map_err(|source| {
            self.halt();
            self.protocol_fault(Operation::Prepare, source)
        })
    }

    /// Execute the prepared statement and fetch until the result set ends, then close the
    /// cursor, all under one hold of the access lock. A fetch error ends the fetch loop the
    /// same way end-of-results does. Returns the number of rows fetched.
    pub fn execute_fetch<F>(&self, client: &C, mut on_row: F) -> Result<usize>
    where
        F: FnMut(&Row),
    {
        let mut guard = self.access.lock();
        if self.is_halted() {
            return Err(HarnessError::Aborted);
        }
        let handles = &mut *guard;
        let (Some(session), Some(statement)) =
            (handles.session.as_mut(), handles.statement.as_mut())
        else {
            return Err(self.protocol_fault(Operation::Execute, not_open()));
        };

        client.execute(session, statement).map_err(|source| {
            self.halt();
            self.protocol_fault(Operation::Execute, source)
        })?;

        let mut rows = 0;
        loop {
            match client.fetch(statement) {
                Ok(Some(row)) => {
                    on_row(&row);
                    rows += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Fetch on bundle {} stopped after {} rows: {}", self.slot, rows, e);
                    break;
                }
            }
        }

        client.close_cursor(statement).map_err(|source| {
            self.halt();
            self.protocol_fault(Operation::CloseCursor, source)
        })?;
        Ok(rows)
    }

    /// Refuse every later prepare and execute on this bundle. Teardown is still allowed.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Bump the version counter and wake every waiter. Returns the new version.
    pub fn publish(&self) -> u64 {
        let mut state = self.version.lock();
        state.counter += 1;
        self.version_ready.notify_all();
        state.counter
    }

    /// Block until the counter exceeds `last_seen` or the stream is closed. The check, the
    /// wait, and the read of the new value happen under one hold of the version lock, so a
    /// publish between the check and the wait cannot be missed.
    pub fn await_fresh(&self, last_seen: u64) -> Freshness {
        let mut state = self.version.lock();
        while state.counter <= last_seen && !state.closed {
            self.version_ready.wait(&mut state);
        }
        if state.counter > last_seen {
            Freshness::Fresh(state.counter)
        } else {
            Freshness::Exhausted
        }
    }

    /// Mark that no further versions will be published and release every waiter.
    pub fn close_stream(&self) {
        let mut state = self.version.lock();
        state.closed = true;
        self.version_ready.notify_all();
    }

    pub fn version(&self) -> u64 {
        self.version.lock().counter
    }

    /// Release the statement and disconnect the session. Called only by the owning worker.
    /// A failing release is fatal, but the session is still disconnected first; a failing
    /// disconnect is reported and otherwise ignored. Calling this on an already torn down
    /// bundle is a no-op.
    pub fn teardown(&self, client: &C) -> Result<()> {
        let mut guard = self.access.lock();
        let handles = &mut *guard;

        let mut released = Ok(());
        if let Some(statement) = handles.statement.take() {
            released = match handles.session.as_mut() {
                Some(session) => client
                    .release(session, statement)
                    .map_err(|source| self.protocol_fault(Operation::FreeStmt, source)),
                None => Err(self.protocol_fault(Operation::FreeStmt, not_open())),
            };
        }

        if let Some(session) = handles.session.take() {
            if let Err(source) = client.disconnect(session) {
                let fault = self.protocol_fault(Operation::Disconnect, source);
                warn!("{}", fault.diagnostic());
            }
        }

        released?;
        debug!("Bundle {} torn down", self.slot);
        Ok(())
    }

    fn setup_fault(&self, op: Operation, source: ClientError) -> HarnessError {
        HarnessError::Setup {
            op,
            slot: self.slot,
            source,
        }
    }

    fn protocol_fault(&self, op: Operation, source: ClientError) -> HarnessError {
        HarnessError::Protocol {
            op,
            slot: self.slot,
            source,
        }
    }
}

fn not_open() -> ClientError {
    ClientError::sequence("bundle has no open statement")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{StubClient, StubConfig};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_open_prepare_execute_teardown() {
        let client = StubClient::default();
        let bundle = ResourceBundle::<StubClient>::new(3);
        assert!(!bundle.is_open());

        bundle.open(&client, "localhost", 5656).unwrap();
        assert!(bundle.is_open());

        bundle.prepare(&client, "select 1").unwrap();
        let mut seen = Vec::new();
        let rows = bundle
            .execute_fetch(&client, |row| seen.push(row.clone()))
            .unwrap();
        assert_eq!(rows, 3);
        assert_eq!(seen.len(), 3);

        bundle.teardown(&client).unwrap();
        assert!(!bundle.is_open());
        bundle.teardown(&client).unwrap();

        let stats = client.stats();
        assert_eq!(stats.live_sessions(), 0);
        assert_eq!(stats.live_statements(), 0);
    }

    #[test]
    fn test_execute_before_prepare_is_protocol_fault() {
        let client = StubClient::default();
        let bundle = ResourceBundle::<StubClient>::new(1);
        bundle.open(&client, "localhost", 5656).unwrap();

        let err = bundle.execute_fetch(&client, |_| {}).unwrap_err();
        match err {
            HarnessError::Protocol { op, slot, source } => {
                assert_eq!(op, Operation::Execute);
                assert_eq!(slot, 1);
                assert_eq!(source.code, "HY010");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_prepare_on_unopened_bundle() {
        let client = StubClient::default();
        let bundle = ResourceBundle::<StubClient>::new(0);
        let err = bundle.prepare(&client, "select 1").unwrap_err();
        assert_eq!(err.slot(), Some(0));
    }

    #[test]
    fn test_connect_failure_is_setup_fault() {
        let client = StubClient::new(StubConfig {
            fail_connect: true,
            ..StubConfig::default()
        });
        let bundle = ResourceBundle::<StubClient>::new(2);
        let err = bundle.open(&client, "db", 1).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Setup {
                op: Operation::Connect,
                slot: 2,
                ..
            }
        ));
        assert!(!bundle.is_open());
    }

    #[test]
    fn test_failed_prepare_halts_bundle() {
        let client = StubClient::new(StubConfig {
            fail_prepare_after: Some(1),
            ..StubConfig::default()
        });
        let bundle = ResourceBundle::<StubClient>::new(4);
        bundle.open(&client, "localhost", 5656).unwrap();

        bundle.prepare(&client, "select 1").unwrap();
        assert!(matches!(
            bundle.prepare(&client, "select 1"),
            Err(HarnessError::Protocol {
                op: Operation::Prepare,
                slot: 4,
                ..
            })
        ));
        assert!(bundle.is_halted());

        // The statement is still prepared, but the bundle refuses further work.
        assert!(matches!(
            bundle.execute_fetch(&client, |_| {}),
            Err(HarnessError::Aborted)
        ));
        assert_eq!(client.stats().executes(), 0);

        bundle.teardown(&client).unwrap();
        assert_eq!(client.stats().live_sessions(), 0);
    }

    #[test]
    fn test_failed_release_still_disconnects() {
        let client = StubClient::new(StubConfig {
            fail_release: true,
            ..StubConfig::default()
        });
        let bundle = ResourceBundle::<StubClient>::new(0);
        bundle.open(&client, "localhost", 5656).unwrap();

        let err = bundle.teardown(&client).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Protocol {
                op: Operation::FreeStmt,
                ..
            }
        ));
        assert_eq!(client.stats().live_sessions(), 0);
        assert!(!bundle.is_open());
    }

    #[test]
    fn test_publish_wakes_waiter() {
        let bundle = Arc::new(ResourceBundle::<StubClient>::new(0));

        let waiter = {
            let bundle = Arc::clone(&bundle);
            thread::spawn(move || bundle.await_fresh(0))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(bundle.publish(), 1);
        assert_eq!(waiter.join().unwrap(), Freshness::Fresh(1));
    }

    #[test]
    fn test_publish_before_wait_is_not_missed() {
        let bundle = ResourceBundle::<StubClient>::new(0);
        bundle.publish();
        bundle.publish();
        assert_eq!(bundle.await_fresh(0), Freshness::Fresh(2));
        assert_eq!(bundle.await_fresh(1), Freshness::Fresh(2));
    }

    #[test]
    fn test_closed_stream_releases_waiter() {
        let bundle = Arc::new(ResourceBundle::<StubClient>::new(0));
        bundle.publish();

        let waiter = {
            let bundle = Arc::clone(&bundle);
            thread::spawn(move || bundle.await_fresh(1))
        };

        thread::sleep(Duration::from_millis(20));
        bundle.close_stream();
        assert_eq!(waiter.join().unwrap(), Freshness::Exhausted);

        // Versions published before closing are still delivered.
        assert_eq!(bundle.await_fresh(0), Freshness::Fresh(1));
    }
}
