use anyhow::{Context, Result};
use clap::CommandFactory;
use clap::error::ErrorKind;
use std::io;
use std::process::ExitCode;
use tracing::info;

use stmt_handoff::client::{PostgresClient, SqliteClient, StubClient};
use stmt_handoff::config::{Backend, Config, RunConfig};
use stmt_handoff::{Coordinator, DbClient, HarnessError};

fn main() -> ExitCode {
    let config = Config::load();

    // Logs go to stderr; stdout carries the timing report and printed rows.
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .with_writer(io::stderr)
        .init();

    info!("stmt-handoff v{}", env!("CARGO_PKG_VERSION"));

    let run_config = match config.run_config() {
        Ok(run_config) => run_config,
        Err(e) => Config::command()
            .error(ErrorKind::ValueValidation, e.to_string())
            .exit(),
    };

    match run(&config, run_config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<HarnessError>() {
                Some(harness) => {
                    eprintln!("{}", harness.diagnostic());
                    ExitCode::from(harness.exit_code())
                }
                None => {
                    eprintln!("ERROR : {err:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn run(config: &Config, run_config: RunConfig) -> Result<()> {
    match config.backend {
        Backend::Postgres => {
            let client = PostgresClient::new(config.postgres_options())
                .context("Failed to start PostgreSQL client")?;
            execute(client, run_config)
        }
        Backend::Sqlite => {
            let client = SqliteClient::new(config.database.clone());
            if config.seed_rows > 0 {
                client
                    .seed(config.seed_rows)
                    .with_context(|| format!("Failed to seed {}", client.path()))?;
            }
            execute(client, run_config)
        }
        Backend::Stub => execute(StubClient::new(config.stub_config()), run_config),
    }
}

fn execute<C: DbClient>(client: C, run_config: RunConfig) -> Result<()> {
    let coordinator = Coordinator::new(client, run_config);
    let summary = coordinator.run()?;
    summary.report(&mut io::stdout().lock())?;
    Ok(())
}
