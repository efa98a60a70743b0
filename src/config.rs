use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::client::{PostgresOptions, StubConfig};
use crate::{HarnessError, Result};

/// Query every preparer prepares: one tag's readings over a single day.
pub const DEFAULT_QUERY: &str = "SELECT name, time, value FROM tag WHERE name = 'TAG_00' \
                                 AND time BETWEEN '2017-01-01' AND '2017-01-02'";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// PostgreSQL wire protocol at host:port
    Postgres,
    /// Embedded SQLite database file
    Sqlite,
    /// In-process client for validating the harness itself
    Stub,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "stmt-handoff")]
#[command(about = "stmt-handoff - stress cross-thread use of prepared statements\nEvery worker opens one session and statement, then prepares or executes on statements other workers opened", long_about = None)]
pub struct Config {
    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Iterations per worker
    pub test_num: usize,

    /// Number of workers and bundles (>= 2)
    pub thread_count: usize,

    /// Print fetched rows when non-zero
    pub print_rows: u32,

    #[arg(long, value_enum, default_value = "postgres", help = "Database client backend")]
    pub backend: Backend,

    #[arg(long, default_value = DEFAULT_QUERY, help = "Query text every preparer prepares")]
    pub query: String,

    #[arg(long, default_value = "warn", help = "Tracing filter directive (e.g. info, stmt_handoff=debug)")]
    pub log_level: String,

    // PostgreSQL backend
    #[arg(long, default_value = "postgres", help = "PostgreSQL user")]
    pub user: String,

    #[arg(long, help = "PostgreSQL password")]
    pub password: Option<String>,

    #[arg(long, default_value = "postgres", help = "PostgreSQL database name")]
    pub dbname: String,

    #[arg(long, default_value = "2", help = "Runtime threads driving PostgreSQL connections")]
    pub io_threads: usize,

    // SQLite backend
    #[arg(long, default_value = "handoff.db", help = "SQLite database file")]
    pub database: String,

    #[arg(long, default_value = "0", help = "Rows to insert into the tag table before the run")]
    pub seed_rows: usize,

    // Stub backend
    #[arg(long, help = "Fail a bundle's prepare after this many successful prepares on it")]
    pub stub_fail_prepare_after: Option<u64>,

    #[arg(long, help = "Fail a bundle's execute after this many successful executes on it")]
    pub stub_fail_execute_after: Option<u64>,

    #[arg(long, default_value = "0", help = "Maximum random delay inside each stub call, in microseconds")]
    pub stub_jitter_us: u64,

    #[arg(long, default_value = "3", help = "Rows returned by each stub execute")]
    pub stub_rows: usize,
}

impl Config {
    /// Get a configuration instance from the command line
    pub fn load() -> Self {
        Config::parse()
    }

    /// Validated run parameters
    pub fn run_config(&self) -> Result<RunConfig> {
        if self.thread_count < 2 {
            return Err(HarnessError::InvalidConfig(
                "thread_count must be >= 2".to_string(),
            ));
        }
        if self.query.trim().is_empty() {
            return Err(HarnessError::InvalidConfig(
                "query must not be empty".to_string(),
            ));
        }

        Ok(RunConfig {
            host: self.host.clone(),
            port: self.port,
            test_num: self.test_num,
            thread_count: self.thread_count,
            print_rows: self.print_rows != 0,
            query: self.query.clone(),
        })
    }

    pub fn postgres_options(&self) -> PostgresOptions {
        PostgresOptions {
            user: self.user.clone(),
            password: self.password.clone(),
            dbname: self.dbname.clone(),
            io_threads: self.io_threads,
        }
    }

    pub fn stub_config(&self) -> StubConfig {
        StubConfig {
            fail_prepare_after: self.stub_fail_prepare_after,
            fail_execute_after: self.stub_fail_execute_after,
            fail_connect: false,
            fail_release: false,
            jitter: (self.stub_jitter_us > 0).then(|| Duration::from_micros(self.stub_jitter_us)),
            rows_per_execute: self.stub_rows,
        }
    }
}

/// Parameters of one run, independent of the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub host: String,
    pub port: u16,
    pub test_num: usize,
    pub thread_count: usize,
    pub print_rows: bool,
    pub query: String,
}

impl RunConfig {
    pub fn new(host: impl Into<String>, port: u16, test_num: usize, thread_count: usize) -> Self {
        Self {
            host: host.into(),
            port,
            test_num,
            thread_count,
            print_rows: false,
            query: DEFAULT_QUERY.to_string(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_print_rows(mut self, print_rows: bool) -> Self {
        self.print_rows = print_rows;
        self
    }
}
