// Database client backends exercised by the harness
pub mod postgres;
pub mod sqlite;
pub mod stub;

use std::fmt;

use thiserror::Error;

pub use postgres::{PostgresClient, PostgresOptions};
pub use sqlite::SqliteClient;
pub use stub::{StubClient, StubConfig, StubStats};

/// A fetched row rendered to text, one entry per column (`None` for SQL NULL).
pub type Row = Vec<Option<String>>;

/// Error reported by a client backend: a backend-specific code plus its message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct ClientError {
    pub code: String,
    pub message: String,
}

impl ClientError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Function sequence error, raised when a handle is used out of order.
    pub fn sequence(message: impl Into<String>) -> Self {
        Self::new("HY010", message)
    }
}

/// The narrow interface the harness drives. A session and its statement are created on
/// one thread and then used from others, so both must be `Send`; the harness serializes
/// every call on a statement behind that bundle's access lock.
pub trait DbClient: Send + Sync {
    type Session: Send;
    type Statement: Send;

    /// Short backend name used in log lines.
    fn name(&self) -> &'static str;

    fn connect(&self, host: &str, port: u16) -> Result<Self::Session, ClientError>;

    fn alloc_statement(&self, session: &mut Self::Session) -> Result<Self::Statement, ClientError>;

    fn prepare(
        &self,
        session: &mut Self::Session,
        statement: &mut Self::Statement,
        sql: &str,
    ) -> Result<(), ClientError>;

    fn execute(
        &self,
        session: &mut Self::Session,
        statement: &mut Self::Statement,
    ) -> Result<(), ClientError>;

    /// Next row of the open result set, or `None` once it is exhausted.
    fn fetch(&self, statement: &mut Self::Statement) -> Result<Option<Row>, ClientError>;

    /// Close the result set opened by `execute`, keeping the prepared statement.
    fn close_cursor(&self, statement: &mut Self::Statement) -> Result<(), ClientError>;

    fn release(
        &self,
        session: &mut Self::Session,
        statement: Self::Statement,
    ) -> Result<(), ClientError>;

    fn disconnect(&self, session: Self::Session) -> Result<(), ClientError>;
}

/// Render a row using the fixed-width layout of the tag query printout.
pub fn format_row(row: &Row) -> String {
    let mut line = String::new();
    for value in row {
        let cell = value.as_deref().unwrap_or("NULL");
        line.push_str(&format!("{cell:<33}"));
    }
    line.trim_end().to_string()
}

/// Header block printed before the rows of each execution.
pub struct RowHeader;

impl fmt::Display for RowHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "-".repeat(80);
        writeln!(f, "{rule}")?;
        writeln!(f, "{:<33}{:<33}{:<33}", "NAME", "TIME", "VALUE")?;
        write!(f, "{rule}")
    }
}
