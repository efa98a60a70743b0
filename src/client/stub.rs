use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::{ClientError, DbClient, Row};

/// Behavior knobs for the in-process client.
#[derive(Debug, Clone)]
pub struct StubConfig {
    /// Fail a session's prepare once this many prepares have succeeded on that session.
    pub fail_prepare_after: Option<u64>,
    /// Fail a session's execute once this many executes have succeeded on that session.
    pub fail_execute_after: Option<u64>,
    /// Refuse connections outright.
    pub fail_connect: bool,
    /// Fail every statement release.
    pub fail_release: bool,
    /// Upper bound of a random sleep taken inside every statement call.
    pub jitter: Option<Duration>,
    /// Rows produced by each execute.
    pub rows_per_execute: usize,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            fail_prepare_after: None,
            fail_execute_after: None,
            fail_connect: false,
            fail_release: false,
            jitter: None,
            rows_per_execute: 3,
        }
    }
}

/// Counters shared by every session the client hands out.
#[derive(Debug, Default)]
pub struct StubStats {
    prepares: AtomicU64,
    executes: AtomicU64,
    rows_fetched: AtomicU64,
    overlaps: AtomicUsize,
    live_sessions: AtomicUsize,
    live_statements: AtomicUsize,
}

impl StubStats {
    pub fn prepares(&self) -> u64 {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> u64 {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn rows_fetched(&self) -> u64 {
        self.rows_fetched.load(Ordering::SeqCst)
    }

    /// Number of times a statement call started while another call on the same
    /// statement was still in progress, or a prepare or execute arrived while the
    /// statement's previous result set was still open.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }

    pub fn live_statements(&self) -> usize {
        self.live_statements.load(Ordering::SeqCst)
    }
}

/// Non-blocking client used to exercise the harness without a database server.
#[derive(Debug)]
pub struct StubClient {
    config: StubConfig,
    next_session: AtomicUsize,
    stats: Arc<StubStats>,
}

#[derive(Debug)]
pub struct StubSession {
    id: usize,
    prepares: u64,
    executes: u64,
}

#[derive(Debug)]
pub struct StubStatement {
    session: usize,
    prepared: Option<String>,
    pending: VecDeque<Row>,
    cursor_open: bool,
    in_use: Arc<AtomicUsize>,
}

/// Marks a statement as busy for the duration of one client call.
struct EntryGuard {
    in_use: Arc<AtomicUsize>,
}

impl EntryGuard {
    fn enter(statement: &StubStatement, stats: &StubStats) -> Self {
        if statement.in_use.fetch_add(1, Ordering::SeqCst) != 0 {
            stats.overlaps.fetch_add(1, Ordering::SeqCst);
            warn!("Overlapping call detected on statement of session {}", statement.session);
        }
        Self {
            in_use: Arc::clone(&statement.in_use),
        }
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubClient {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            next_session: AtomicUsize::new(0),
            stats: Arc::new(StubStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<StubStats> {
        Arc::clone(&self.stats)
    }

    /// A prepare or execute must not land between another worker's execute and its
    /// close of the result set.
    fn check_sequence(&self, statement: &StubStatement, call: &str) {
        if statement.cursor_open {
            self.stats.overlaps.fetch_add(1, Ordering::SeqCst);
            warn!(
                "{} on statement of session {} while its result set is open",
                call, statement.session
            );
        }
    }

    fn jitter(&self) {
        if let Some(max) = self.config.jitter {
            let micros = max.as_micros() as u64;
            if micros > 0 {
                let pause = rand::rng().random_range(0..=micros);
                thread::sleep(Duration::from_micros(pause));
            }
        }
    }

    fn tag_rows(&self, session: usize) -> VecDeque<Row> {
        (0..self.config.rows_per_execute)
            .map(|i| {
                vec![
                    Some("TAG_00".to_string()),
                    Some(format!("2017-01-01 00:00:{:02} 000:000:000", i % 60)),
                    Some(format!("{:.2}", (session * 100 + i) as f64 / 4.0)),
                ]
            })
            .collect()
    }
}

impl Default for StubClient {
    fn default() -> Self {
        Self::new(StubConfig::default())
    }
}

impl DbClient for StubClient {
    type Session = StubSession;
    type Statement = StubStatement;

    fn name(&self) -> &'static str {
        "stub"
    }

    fn connect(&self, host: &str, port: u16) -> Result<StubSession, ClientError> {
        if self.config.fail_connect {
            return Err(ClientError::new(
                "08001",
                format!("stub refused connection to {host}:{port}"),
            ));
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.stats.live_sessions.fetch_add(1, Ordering::SeqCst);
        debug!("Stub session {} connected to {}:{}", id, host, port);
        Ok(StubSession {
            id,
            prepares: 0,
            executes: 0,
        })
    }

    fn alloc_statement(&self, session: &mut StubSession) -> Result<StubStatement, ClientError> {
        self.stats.live_statements.fetch_add(1, Ordering::SeqCst);
        Ok(StubStatement {
            session: session.id,
            prepared: None,
            pending: VecDeque::new(),
            cursor_open: false,
            in_use: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn prepare(
        &self,
        session: &mut StubSession,
        statement: &mut StubStatement,
        sql: &str,
    ) -> Result<(), ClientError> {
        let _entry = EntryGuard::enter(statement, &self.stats);
        self.check_sequence(statement, "prepare");
        self.jitter();

        if let Some(limit) = self.config.fail_prepare_after {
            if session.prepares >= limit {
                return Err(ClientError::new(
                    "STUB",
                    format!("injected prepare failure on session {}", session.id),
                ));
            }
        }

        if sql.trim().is_empty() {
            return Err(ClientError::new("42601", "empty query text"));
        }

        statement.prepared = Some(sql.to_string());
        statement.pending.clear();
        statement.cursor_open = false;
        session.prepares += 1;
        self.stats.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(
        &self,
        session: &mut StubSession,
        statement: &mut StubStatement,
    ) -> Result<(), ClientError> {
        let _entry = EntryGuard::enter(statement, &self.stats);
        self.check_sequence(statement, "execute");
        self.jitter();

        if statement.prepared.is_none() {
            return Err(ClientError::sequence("statement is not prepared"));
        }

        if let Some(limit) = self.config.fail_execute_after {
            if session.executes >= limit {
                return Err(ClientError::new(
                    "STUB",
                    format!("injected execute failure on session {}", session.id),
                ));
            }
        }

        statement.pending = self.tag_rows(statement.session);
        statement.cursor_open = true;
        session.executes += 1;
        self.stats.executes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fetch(&self, statement: &mut StubStatement) -> Result<Option<Row>, ClientError> {
        let _entry = EntryGuard::enter(statement, &self.stats);
        if !statement.cursor_open {
            return Err(ClientError::sequence("no open result set"));
        }
        let row = statement.pending.pop_front();
        if row.is_some() {
            self.stats.rows_fetched.fetch_add(1, Ordering::SeqCst);
        }
        Ok(row)
    }

    fn close_cursor(&self, statement: &mut StubStatement) -> Result<(), ClientError> {
        let _entry = EntryGuard::enter(statement, &self.stats);
        statement.pending.clear();
        statement.cursor_open = false;
        Ok(())
    }

    fn release(
        &self,
        session: &mut StubSession,
        statement: StubStatement,
    ) -> Result<(), ClientError> {
        if self.config.fail_release {
            return Err(ClientError::new(
                "STUB",
                format!("injected release failure on session {}", session.id),
            ));
        }
        drop(statement);
        self.stats.live_statements.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self, session: StubSession) -> Result<(), ClientError> {
        debug!("Stub session {} disconnected", session.id);
        self.stats.live_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
