use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, warn};

use super::roles::RolePlan;
use super::state::{Phase, RunProgress};
use crate::client::DbClient;
use crate::config::RunConfig;
use crate::session::{BundlePool, PhaseBarrier};
use crate::{HarnessError, Result};

const NO_FAULT: usize = usize::MAX;

/// Everything a worker shares with the other workers for the length of one run.
pub struct RunContext<'a, C: DbClient> {
    pub client: &'a C,
    pub pool: &'a BundlePool<C>,
    pub barrier: &'a PhaseBarrier,
    pub progress: &'a RunProgress,
    pub config: &'a RunConfig,
    pub plan: RolePlan,
    aborted: AtomicBool,
    first_fault: AtomicUsize,
    live_preparers: AtomicUsize,
}

impl<'a, C: DbClient> RunContext<'a, C> {
    pub fn new(
        client: &'a C,
        pool: &'a BundlePool<C>,
        barrier: &'a PhaseBarrier,
        progress: &'a RunProgress,
        config: &'a RunConfig,
        plan: RolePlan,
    ) -> Self {
        Self {
            client,
            pool,
            barrier,
            progress,
            config,
            plan,
            aborted: AtomicBool::new(false),
            first_fault: AtomicUsize::new(NO_FAULT),
            live_preparers: AtomicUsize::new(plan.prepare_count()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Stop the run: refuse further work on every bundle, fail every barrier wait and wake
    /// every executor. `culprit` is the
    /// worker whose fault caused the abort; only the first one is remembered.
    pub fn abort(&self, culprit: Option<usize>) {
        if let Some(index) = culprit {
            let _ = self.first_fault.compare_exchange(
                NO_FAULT,
                index,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        if !self.aborted.swap(true, Ordering::SeqCst) {
            warn!("Run {} aborted", self.progress.run_id());
        }
        self.pool.halt_all();
        self.barrier.abort();
        self.pool.close_streams();
    }

    /// Index of the worker whose fault aborted the run.
    pub fn first_fault(&self) -> Option<usize> {
        match self.first_fault.load(Ordering::SeqCst) {
            NO_FAULT => None,
            index => Some(index),
        }
    }

    /// Called by each preparer after its last iteration. Once the last one is done no
    /// bundle can gain another version, so executors still waiting are released.
    pub fn preparer_finished(&self) {
        if self.live_preparers.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("All preparers finished; closing version streams");
            self.pool.close_streams();
        }
    }

    /// Rendezvous with every other worker at `phase`. The leader records the transition.
    pub fn wait_phase(&self, phase: Phase) -> Result<()> {
        if self.is_aborted() {
            return Err(HarnessError::Aborted);
        }

        let wait = self.barrier.wait()?;
        if wait.is_leader() {
            let mut progress = self.progress.lock();
            progress.advance(phase.reached())?;
            if let Some(next) = phase.following() {
                progress.advance(next)?;
            }
        }
        Ok(())
    }
}
