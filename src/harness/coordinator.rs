use std::io::Write;
use std::thread;

use tracing::{error, info, warn};
use uuid::Uuid;

use super::context::RunContext;
use super::roles::RolePlan;
use super::state::{RunProgress, RunState};
use super::worker::{WorkerReport, run_worker};
use crate::client::DbClient;
use crate::config::RunConfig;
use crate::session::{BundlePool, PhaseBarrier};
use crate::{HarnessError, Result};

/// Owns the client and the run parameters; each call to [`Coordinator::run`] performs one
/// complete run with a fresh pool and barrier.
pub struct Coordinator<C: DbClient> {
    client: C,
    config: RunConfig,
}

impl<C: DbClient> Coordinator<C> {
    pub fn new(client: C, config: RunConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run(&self) -> Result<RunSummary> {
        let progress = RunProgress::new();
        let plan = RolePlan::split(self.config.thread_count)?;
        let threads = plan.thread_count();

        info!(
            run_id = %progress.run_id(),
            backend = self.client.name(),
            threads,
            preparers = plan.prepare_count(),
            executors = plan.execute_count(),
            iterations = self.config.test_num,
            "Starting run against {}:{}",
            self.config.host,
            self.config.port
        );

        let pool = BundlePool::<C>::create(threads)?;
        progress.advance(RunState::PoolReady)?;
        let barrier = PhaseBarrier::new(threads)?;

        let ctx = RunContext::new(&self.client, &pool, &barrier, &progress, &self.config, plan);

        let (outcomes, spawn_error) = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(threads);
            let mut spawn_error = None;

            // Hold the run state until every worker exists so the first barrier's leader
            // cannot record its transition ahead of this one.
            let mut state = progress.lock();
            for index in 0..threads {
                let ctx = &ctx;
                let spawned = thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn_scoped(scope, move || run_worker(ctx, index));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(source) => {
                        spawn_error = Some(HarnessError::Spawn { index, source });
                        ctx.abort(None);
                        break;
                    }
                }
            }
            if spawn_error.is_none() {
                if let Err(e) = state.advance(RunState::WorkersSpawned) {
                    spawn_error = Some(e);
                    ctx.abort(None);
                }
            }
            drop(state);

            let outcomes: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
            (outcomes, spawn_error)
        });

        let first_fault = ctx.first_fault();
        drop(ctx);

        let leftover = pool.release_remaining(&self.client);
        if leftover > 0 {
            warn!("{} bundles were not torn down by their owners", leftover);
        }

        if let Some(e) = spawn_error {
            error!("{}", e.diagnostic());
            return Err(e);
        }

        let mut reports = Vec::with_capacity(threads);
        let mut failures = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => failures.push((index, e)),
                Err(_) => failures.push((index, HarnessError::WorkerPanicked(index))),
            }
        }

        if !failures.is_empty() {
            let root = root_cause(failures, first_fault);
            error!("Run {} failed: {}", progress.run_id(), root.diagnostic());
            return Err(root);
        }

        progress.advance(RunState::Joined)?;
        drop(pool);

        Ok(RunSummary {
            run_id: progress.run_id(),
            plan,
            reports,
            progress,
        })
    }
}

/// The fault that aborted the run: the first recorded culprit's error, otherwise the first
/// error that is not merely the echo of an abort.
fn root_cause(failures: Vec<(usize, HarnessError)>, first_fault: Option<usize>) -> HarnessError {
    let mut fallback = None;
    for (index, err) in failures {
        if matches!(err, HarnessError::Aborted) {
            continue;
        }
        if Some(index) == first_fault {
            return err;
        }
        if fallback.is_none() {
            fallback = Some(err);
        }
    }
    fallback.unwrap_or(HarnessError::Aborted)
}

/// Outcome of a successful run.
#[derive(Debug)]
pub struct RunSummary {
    run_id: Uuid,
    plan: RolePlan,
    reports: Vec<WorkerReport>,
    progress: RunProgress,
}

impl RunSummary {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn plan(&self) -> RolePlan {
        self.plan
    }

    /// Per-worker reports, ordered by worker index.
    pub fn reports(&self) -> &[WorkerReport] {
        &self.reports
    }

    pub fn state(&self) -> RunState {
        self.progress.current()
    }

    pub fn history(&self) -> Vec<RunState> {
        self.progress.history()
    }

    pub fn rows_fetched(&self) -> u64 {
        self.reports.iter().map(|r| r.rows_fetched).sum()
    }

    pub fn skipped(&self) -> usize {
        self.reports.iter().map(|r| r.skipped).sum()
    }

    /// Write one elapsed-time line per worker and mark the run reported.
    pub fn report<W: Write>(&self, out: &mut W) -> Result<()> {
        for report in &self.reports {
            writeln!(out, "{}", report.elapsed_line())?;
        }
        out.flush()?;
        self.progress.advance(RunState::Reported)?;
        let skipped = self.skipped();
        if skipped > 0 {
            warn!(
                run_id = %self.run_id,
                skipped,
                "{} executor iterations found no fresh version after the preparers finished",
                skipped
            );
        }
        info!(
            run_id = %self.run_id,
            rows = self.rows_fetched(),
            skipped = self.skipped(),
            "Run reported"
        );
        Ok(())
    }
}
