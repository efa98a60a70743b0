use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, Statement};
use tracing::{debug, error};

use super::{ClientError, DbClient, Row};

/// Connection parameters that are not part of the positional `host port` pair.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub io_threads: usize,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: None,
            dbname: "postgres".to_string(),
            io_threads: 2,
        }
    }
}

/// PostgreSQL wire-protocol backend. Worker threads are plain OS threads, so every call
/// blocks on a runtime shared by all sessions; each session's connection future runs as a
/// task on that runtime.
#[derive(Debug)]
pub struct PostgresClient {
    runtime: Runtime,
    options: PostgresOptions,
}

#[derive(Debug)]
pub struct PgSession {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
    peer: String,
}

#[derive(Debug, Default)]
pub struct PgStatement {
    prepared: Option<Statement>,
    pending: VecDeque<Row>,
    cursor_open: bool,
}

impl PostgresClient {
    pub fn new(options: PostgresOptions) -> Result<Self, ClientError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(options.io_threads.max(1))
            .thread_name("pg-io")
            .enable_all()
            .build()
            .map_err(|e| ClientError::new("58030", format!("failed to start runtime: {e}")))?;
        Ok(Self { runtime, options })
    }
}

impl DbClient for PostgresClient {
    type Session = PgSession;
    type Statement = PgStatement;

    fn name(&self) -> &'static str {
        "postgres"
    }

    fn connect(&self, host: &str, port: u16) -> Result<PgSession, ClientError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(&self.options.user)
            .dbname(&self.options.dbname);
        if let Some(password) = &self.options.password {
            config.password(password);
        }

        let (client, connection) = self
            .runtime
            .block_on(config.connect(NoTls))
            .map_err(map_pg_error)?;

        let peer = format!("{host}:{port}");
        let driver = self.runtime.spawn({
            let peer = peer.clone();
            async move {
                if let Err(e) = connection.await {
                    error!("Connection error from {}: {}", peer, e);
                }
            }
        });

        debug!("Connected to {}", peer);
        Ok(PgSession { client, driver, peer })
    }

    fn alloc_statement(&self, _session: &mut PgSession) -> Result<PgStatement, ClientError> {
        Ok(PgStatement::default())
    }

    fn prepare(
        &self,
        session: &mut PgSession,
        statement: &mut PgStatement,
        sql: &str,
    ) -> Result<(), ClientError> {
        let prepared = self
            .runtime
            .block_on(session.client.prepare(sql))
            .map_err(map_pg_error)?;
        // Replacing the old statement closes it on the server.
        statement.prepared = Some(prepared);
        statement.pending.clear();
        statement.cursor_open = false;
        Ok(())
    }

    fn execute(
        &self,
        session: &mut PgSession,
        statement: &mut PgStatement,
    ) -> Result<(), ClientError> {
        let prepared = statement
            .prepared
            .as_ref()
            .ok_or_else(|| ClientError::sequence("statement is not prepared"))?;

        let rows = self
            .runtime
            .block_on(session.client.query(prepared, &[]))
            .map_err(map_pg_error)?;

        let mut pending = VecDeque::with_capacity(rows.len());
        for row in &rows {
            pending.push_back(render_row(row)?);
        }
        statement.pending = pending;
        statement.cursor_open = true;
        Ok(())
    }

    fn fetch(&self, statement: &mut PgStatement) -> Result<Option<Row>, ClientError> {
        if !statement.cursor_open {
            return Err(ClientError::sequence("no open result set"));
        }
        Ok(statement.pending.pop_front())
    }

    fn close_cursor(&self, statement: &mut PgStatement) -> Result<(), ClientError> {
        statement.pending.clear();
        statement.cursor_open = false;
        Ok(())
    }

    fn release(&self, _session: &mut PgSession, statement: PgStatement) -> Result<(), ClientError> {
        drop(statement);
        Ok(())
    }

    fn disconnect(&self, session: PgSession) -> Result<(), ClientError> {
        let PgSession { client, driver, peer } = session;
        // Dropping the last client handle ends the connection future.
        drop(client);
        self.runtime
            .block_on(driver)
            .map_err(|e| ClientError::new("08006", format!("connection task for {peer} failed: {e}")))?;
        debug!("Disconnected from {}", peer);
        Ok(())
    }
}

fn render_row(row: &tokio_postgres::Row) -> Result<Row, ClientError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        values.push(render_column(row, idx, column.type_())?);
    }
    Ok(values)
}

fn render_column(
    row: &tokio_postgres::Row,
    idx: usize,
    ty: &Type,
) -> Result<Option<String>, ClientError> {
    let value = match *ty {
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx).map_err(map_pg_error)?
        }
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map_err(map_pg_error)?
            .map(|v| v.to_string()),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map_err(map_pg_error)?
            .map(|v| v.to_string()),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .map_err(map_pg_error)?
            .map(|v| v.to_string()),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(map_pg_error)?
            .map(|v| format!("{v:.2}")),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .map_err(map_pg_error)?
            .map(|v| format!("{v:.2}")),
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .map_err(map_pg_error)?
            .map(|v| v.to_string()),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map_err(map_pg_error)?
            .map(|v| v.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map_err(map_pg_error)?
            .map(|v| v.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .map_err(map_pg_error)?
            .map(|v| v.to_string()),
        ref other => Some(format!("<{}>", other.name())),
    };
    Ok(value)
}

/// Map a tokio-postgres error to a client error carrying the SQLSTATE when the server sent one.
pub fn map_pg_error(err: tokio_postgres::Error) -> ClientError {
    if let Some(db_err) = err.as_db_error() {
        return ClientError::new(db_err.code().code(), db_err.message());
    }
    if err.is_closed() {
        return ClientError::new("08006", err.to_string());
    }
    ClientError::new("08000", err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_refused_maps_to_connection_error() {
        let client = PostgresClient::new(PostgresOptions::default()).unwrap();
        // Port 1 is reserved and nothing listens there in test environments.
        let err = client.connect("127.0.0.1", 1).unwrap_err();
        assert!(err.code.starts_with("08"), "unexpected code {}", err.code);
    }

    #[test]
    fn test_fetch_without_open_cursor_fails() {
        let mut stmt = PgStatement::default();
        assert!(stmt.prepared.is_none());
        let client = PostgresClient::new(PostgresOptions::default()).unwrap();
        assert_eq!(client.fetch(&mut stmt).unwrap_err().code, "HY010");
        client.close_cursor(&mut stmt).unwrap();
    }

    #[test]
    fn test_default_options() {
        let options = PostgresOptions::default();
        assert_eq!(options.user, "postgres");
        assert_eq!(options.dbname, "postgres");
        assert!(options.password.is_none());
    }
}
