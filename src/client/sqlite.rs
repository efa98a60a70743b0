use std::collections::VecDeque;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, info};

use super::{ClientError, DbClient, Row};

/// Embedded backend: every session is its own SQLite connection to the same database file.
///
/// `connect` ignores the host and port beyond logging them; the database path is fixed
/// when the client is built.
#[derive(Debug, Clone)]
pub struct SqliteClient {
    path: String,
    busy_timeout: Duration,
}

#[derive(Debug)]
pub struct SqliteSession {
    conn: Connection,
    peer: String,
}

/// The compiled statement lives in the connection's prepared-statement cache, keyed by
/// its SQL, so the handle only needs to remember the text it was prepared with.
#[derive(Debug, Default)]
pub struct SqliteStatement {
    sql: Option<String>,
    pending: VecDeque<Row>,
    cursor_open: bool,
}

impl SqliteClient {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create the `tag` table if needed and append `rows` readings for `TAG_00`
    /// inside the window the default query selects.
    pub fn seed(&self, rows: usize) -> Result<(), ClientError> {
        let mut conn = self.open()?;
        let tx = conn.transaction().map_err(map_sqlite_error)?;
        {
            let mut insert = tx
                .prepare("INSERT INTO tag (name, time, value) VALUES (?1, ?2, ?3)")
                .map_err(map_sqlite_error)?;
            for i in 0..rows {
                let time = format!(
                    "2017-01-01 {:02}:{:02}:{:02}",
                    (i / 3600) % 24,
                    (i / 60) % 60,
                    i % 60
                );
                insert
                    .execute(params!["TAG_00", time, i as f64 * 0.5])
                    .map_err(map_sqlite_error)?;
            }
        }
        tx.commit().map_err(map_sqlite_error)?;
        info!("Seeded {} rows into {}", rows, self.path);
        Ok(())
    }

    fn open(&self) -> Result<Connection, ClientError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;

        let conn = Connection::open_with_flags(&self.path, flags).map_err(map_sqlite_error)?;
        conn.busy_timeout(self.busy_timeout).map_err(map_sqlite_error)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             CREATE TABLE IF NOT EXISTS tag (
                 name TEXT NOT NULL,
                 time TEXT NOT NULL,
                 value REAL
             );",
        )
        .map_err(map_sqlite_error)?;
        Ok(conn)
    }
}

impl DbClient for SqliteClient {
    type Session = SqliteSession;
    type Statement = SqliteStatement;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn connect(&self, host: &str, port: u16) -> Result<SqliteSession, ClientError> {
        let conn = self.open()?;
        let peer = format!("{host}:{port}");
        debug!("Opened SQLite connection to {} for {}", self.path, peer);
        Ok(SqliteSession { conn, peer })
    }

    fn alloc_statement(&self, _session: &mut SqliteSession) -> Result<SqliteStatement, ClientError> {
        Ok(SqliteStatement::default())
    }

    fn prepare(
        &self,
        session: &mut SqliteSession,
        statement: &mut SqliteStatement,
        sql: &str,
    ) -> Result<(), ClientError> {
        session.conn.prepare_cached(sql).map_err(map_sqlite_error)?;
        statement.sql = Some(sql.to_string());
        statement.pending.clear();
        statement.cursor_open = false;
        Ok(())
    }

    fn execute(
        &self,
        session: &mut SqliteSession,
        statement: &mut SqliteStatement,
    ) -> Result<(), ClientError> {
        let sql = statement
            .sql
            .as_deref()
            .ok_or_else(|| ClientError::sequence("statement is not prepared"))?;

        let mut compiled = session.conn.prepare_cached(sql).map_err(map_sqlite_error)?;
        let columns = compiled.column_count();
        let mut rows = compiled.query([]).map_err(map_sqlite_error)?;

        let mut pending = VecDeque::new();
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            let mut values = Vec::with_capacity(columns);
            for idx in 0..columns {
                values.push(render_value(row.get_ref(idx).map_err(map_sqlite_error)?));
            }
            pending.push_back(values);
        }

        statement.pending = pending;
        statement.cursor_open = true;
        Ok(())
    }

    fn fetch(&self, statement: &mut SqliteStatement) -> Result<Option<Row>, ClientError> {
        if !statement.cursor_open {
            return Err(ClientError::sequence("no open result set"));
        }
        Ok(statement.pending.pop_front())
    }

    fn close_cursor(&self, statement: &mut SqliteStatement) -> Result<(), ClientError> {
        statement.pending.clear();
        statement.cursor_open = false;
        Ok(())
    }

    fn release(
        &self,
        session: &mut SqliteSession,
        statement: SqliteStatement,
    ) -> Result<(), ClientError> {
        drop(statement);
        // The session owns exactly one statement, so its cached compilation goes with it.
        session.conn.flush_prepared_statement_cache();
        Ok(())
    }

    fn disconnect(&self, session: SqliteSession) -> Result<(), ClientError> {
        debug!("Closing SQLite connection for {}", session.peer);
        session.conn.close().map_err(|(_, e)| map_sqlite_error(e))
    }
}

fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(format!("{f:.2}")),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(format!("<{} bytes>", bytes.len())),
    }
}

/// Map a rusqlite error to a client error carrying SQLite's extended result code.
pub fn map_sqlite_error(err: rusqlite::Error) -> ClientError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, msg) => {
            let message = msg
                .clone()
                .unwrap_or_else(|| failure.to_string());
            ClientError::new(format!("SQLITE-{}", failure.extended_code), message)
        }
        rusqlite::Error::InvalidQuery => ClientError::new("42601", err.to_string()),
        _ => ClientError::new("HY000", err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client_in(dir: &TempDir) -> SqliteClient {
        SqliteClient::new(dir.path().join("handoff.db").to_string_lossy().into_owned())
    }

    const QUERY: &str = "SELECT name, time, value FROM tag WHERE name = 'TAG_00' \
                         AND time BETWEEN '2017-01-01' AND '2017-01-02'";

    #[test]
    fn test_seeded_rows_are_fetched() {
        let dir = TempDir::new().unwrap();
        let client = client_in(&dir);
        client.seed(5).unwrap();

        let mut session = client.connect("localhost", 0).unwrap();
        let mut stmt = client.alloc_statement(&mut session).unwrap();
        client.prepare(&mut session, &mut stmt, QUERY).unwrap();
        client.execute(&mut session, &mut stmt).unwrap();

        let mut rows = Vec::new();
        while let Some(row) = client.fetch(&mut stmt).unwrap() {
            rows.push(row);
        }
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0][0].as_deref(), Some("TAG_00"));
        assert_eq!(rows[0][1].as_deref(), Some("2017-01-01 00:00:00"));
        assert_eq!(rows[1][2].as_deref(), Some("0.50"));

        client.close_cursor(&mut stmt).unwrap();
        client.release(&mut session, stmt).unwrap();
        client.disconnect(session).unwrap();
    }

    #[test]
    fn test_prepare_reports_sqlite_error() {
        let dir = TempDir::new().unwrap();
        let client = client_in(&dir);

        let mut session = client.connect("localhost", 0).unwrap();
        let mut stmt = client.alloc_statement(&mut session).unwrap();
        let err = client
            .prepare(&mut session, &mut stmt, "SELECT * FROM missing_table")
            .unwrap_err();
        assert!(err.code.starts_with("SQLITE-"), "unexpected code {}", err.code);
        assert!(err.message.contains("missing_table"));
    }

    #[test]
    fn test_statement_prepared_on_one_thread_runs_on_another() {
        let dir = TempDir::new().unwrap();
        let client = client_in(&dir);
        client.seed(2).unwrap();

        let mut session = client.connect("localhost", 0).unwrap();
        let mut stmt = client.alloc_statement(&mut session).unwrap();
        client.prepare(&mut session, &mut stmt, QUERY).unwrap();

        let (session, stmt, count) = std::thread::scope(|s| {
            s.spawn(|| {
                let (mut session, mut stmt) = (session, stmt);
                client.execute(&mut session, &mut stmt).unwrap();
                let mut count = 0;
                while client.fetch(&mut stmt).unwrap().is_some() {
                    count += 1;
                }
                (session, stmt, count)
            })
            .join()
            .unwrap()
        });
        assert_eq!(count, 2);

        let mut session = session;
        client.release(&mut session, stmt).unwrap();
        client.disconnect(session).unwrap();
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(ValueRef::Null), None);
        assert_eq!(render_value(ValueRef::Integer(7)).as_deref(), Some("7"));
        assert_eq!(render_value(ValueRef::Real(1.0)).as_deref(), Some("1.00"));
        assert_eq!(render_value(ValueRef::Blob(&[1, 2])).as_deref(), Some("<2 bytes>"));
    }
}
