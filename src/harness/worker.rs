use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, trace, warn};

use super::context::RunContext;
use super::roles::{Role, pick_target};
use super::state::Phase;
use crate::client::{DbClient, RowHeader, format_row};
use crate::session::Freshness;
use crate::{HarnessError, Result};

/// A version an executor consumed before executing against `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    pub target: usize,
    pub version: u64,
}

/// What one worker did during the steady-state phase.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub index: usize,
    pub role: Role,
    /// Time from the setup barrier to the end of the worker's last iteration.
    pub elapsed: Duration,
    /// Iterations that prepared or executed.
    pub completed: usize,
    /// Executor iterations dropped because the target could not gain a fresh version.
    pub skipped: usize,
    pub rows_fetched: u64,
    /// Executor only: versions consumed, in order.
    pub consumed: Vec<Consumed>,
}

impl WorkerReport {
    fn new(index: usize, role: Role) -> Self {
        Self {
            index,
            role,
            elapsed: Duration::ZERO,
            completed: 0,
            skipped: 0,
            rows_fetched: 0,
            consumed: Vec::new(),
        }
    }

    pub fn elapsed_line(&self) -> String {
        format!(
            "thread {} elapsed time between first execute and barrier: {:.6} sec",
            self.index,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Aborts the run if the worker unwinds, so the others are not left parked at a barrier.
struct UnwindGuard<'c, 'a, C: DbClient> {
    ctx: &'c RunContext<'a, C>,
    index: usize,
}

impl<C: DbClient> Drop for UnwindGuard<'_, '_, C> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Worker {} panicked", self.index);
            self.ctx.abort(Some(self.index));
        }
    }
}

/// Entry point of worker `index`. On any fault the run is aborted and the worker still
/// tears down its own bundle before returning the error.
pub fn run_worker<C: DbClient>(ctx: &RunContext<'_, C>, index: usize) -> Result<WorkerReport> {
    let _unwind = UnwindGuard { ctx, index };
    let role = ctx.plan.role_of(index);
    let span = info_span!("worker", index, %role);
    let _enter = span.enter();

    let mut report = WorkerReport::new(index, role);
    match drive(ctx, index, &mut report) {
        Ok(()) => {
            info!(
                completed = report.completed,
                skipped = report.skipped,
                "Worker finished in {:.6}s",
                report.elapsed.as_secs_f64()
            );
            Ok(report)
        }
        Err(HarnessError::Aborted) => {
            debug!("Worker stopping after abort");
            release_own(ctx, index);
            Err(HarnessError::Aborted)
        }
        Err(e) => {
            ctx.abort(Some(index));
            error!("{}", e.diagnostic());
            release_own(ctx, index);
            Err(e)
        }
    }
}

fn drive<C: DbClient>(
    ctx: &RunContext<'_, C>,
    index: usize,
    report: &mut WorkerReport,
) -> Result<()> {
    let mine = ctx.pool.get(index);
    mine.open(ctx.client, &ctx.config.host, ctx.config.port)?;
    ctx.wait_phase(Phase::Setup)?;

    let started = Instant::now();
    match report.role {
        Role::Preparer => prepare_loop(ctx, index, report)?,
        Role::Executor => execute_loop(ctx, index, report)?,
    }
    report.elapsed = started.elapsed();

    ctx.wait_phase(Phase::Work)?;
    mine.teardown(ctx.client)?;
    ctx.wait_phase(Phase::Teardown)?;
    Ok(())
}

fn prepare_loop<C: DbClient>(
    ctx: &RunContext<'_, C>,
    index: usize,
    report: &mut WorkerReport,
) -> Result<()> {
    let total = ctx.pool.len();
    for iter in 0..ctx.config.test_num {
        if ctx.is_aborted() {
            return Err(HarnessError::Aborted);
        }

        let target = pick_target(index, iter, total);
        let bundle = ctx.pool.get(target);
        bundle.prepare(ctx.client, &ctx.config.query)?;
        let version = bundle.publish();
        trace!(target, version, "Prepared");
        report.completed += 1;
    }
    ctx.preparer_finished();
    Ok(())
}

fn execute_loop<C: DbClient>(
    ctx: &RunContext<'_, C>,
    index: usize,
    report: &mut WorkerReport,
) -> Result<()> {
    let total = ctx.pool.len();
    let mut last_seen = vec![0u64; total];

    for iter in 0..ctx.config.test_num {
        if ctx.is_aborted() {
            return Err(HarnessError::Aborted);
        }

        let target = pick_target(index, iter, total);
        let bundle = ctx.pool.get(target);

        let version = match bundle.await_fresh(last_seen[target]) {
            Freshness::Fresh(version) => version,
            Freshness::Exhausted => {
                if ctx.is_aborted() {
                    return Err(HarnessError::Aborted);
                }
                debug!(target, last_seen = last_seen[target], "No fresh version left; skipping");
                report.skipped += 1;
                continue;
            }
        };
        last_seen[target] = version;
        report.consumed.push(Consumed { target, version });

        if ctx.is_aborted() {
            return Err(HarnessError::Aborted);
        }

        let mut printed = String::new();
        let print_rows = ctx.config.print_rows;
        let rows = bundle.execute_fetch(ctx.client, |row| {
            if print_rows {
                printed.push_str(&format_row(row));
                printed.push('\n');
            }
        })?;
        trace!(target, version, rows, "Executed");

        if print_rows {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{RowHeader}")?;
            stdout.write_all(printed.as_bytes())?;
        }

        report.rows_fetched += rows as u64;
        report.completed += 1;
    }
    Ok(())
}

fn release_own<C: DbClient>(ctx: &RunContext<'_, C>, index: usize) {
    if let Err(e) = ctx.pool.get(index).teardown(ctx.client) {
        warn!("Teardown after abort failed: {}", e.diagnostic());
    }
}
