use std::fmt;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::{HarnessError, Result};

/// Coordinator state machine. Each state has exactly one successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    PoolReady,
    WorkersSpawned,
    /// Every worker opened its bundle.
    Barrier1,
    SteadyState,
    /// Every worker finished its iterations.
    Barrier2,
    Teardown,
    /// Every worker released its bundle.
    Barrier3,
    Joined,
    Reported,
}

impl RunState {
    pub fn next(self) -> Option<RunState> {
        use RunState::*;
        match self {
            Init => Some(PoolReady),
            PoolReady => Some(WorkersSpawned),
            WorkersSpawned => Some(Barrier1),
            Barrier1 => Some(SteadyState),
            SteadyState => Some(Barrier2),
            Barrier2 => Some(Teardown),
            Teardown => Some(Barrier3),
            Barrier3 => Some(Joined),
            Joined => Some(Reported),
            Reported => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "INIT",
            RunState::PoolReady => "POOL_READY",
            RunState::WorkersSpawned => "WORKERS_SPAWNED",
            RunState::Barrier1 => "BARRIER1",
            RunState::SteadyState => "STEADY_STATE",
            RunState::Barrier2 => "BARRIER2",
            RunState::Teardown => "TEARDOWN",
            RunState::Barrier3 => "BARRIER3",
            RunState::Joined => "JOINED",
            RunState::Reported => "REPORTED",
        };
        f.write_str(name)
    }
}

/// The three rendezvous points of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Work,
    Teardown,
}

impl Phase {
    /// State recorded when every worker has reached this phase's barrier.
    pub fn reached(self) -> RunState {
        match self {
            Phase::Setup => RunState::Barrier1,
            Phase::Work => RunState::Barrier2,
            Phase::Teardown => RunState::Barrier3,
        }
    }

    /// State the run enters once the barrier releases, if the barrier opens a new phase.
    pub fn following(self) -> Option<RunState> {
        match self {
            Phase::Setup => Some(RunState::SteadyState),
            Phase::Work => Some(RunState::Teardown),
            Phase::Teardown => None,
        }
    }
}

#[derive(Debug)]
struct Progress {
    state: RunState,
    history: Vec<RunState>,
}

/// Current state of a run plus every state it went through.
#[derive(Debug)]
pub struct RunProgress {
    run_id: Uuid,
    inner: Mutex<Progress>,
}

/// Exclusive hold on the run state; other transitions wait until it is dropped.
pub struct ProgressGuard<'a> {
    run_id: Uuid,
    inner: MutexGuard<'a, Progress>,
}

impl ProgressGuard<'_> {
    pub fn advance(&mut self, to: RunState) -> Result<()> {
        let from = self.inner.state;
        if from.next() != Some(to) {
            return Err(HarnessError::IllegalTransition { from, to });
        }
        self.inner.state = to;
        self.inner.history.push(to);
        debug!("Run {} entered {}", self.run_id, to);
        Ok(())
    }
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            inner: Mutex::new(Progress {
                state: RunState::Init,
                history: vec![RunState::Init],
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn lock(&self) -> ProgressGuard<'_> {
        ProgressGuard {
            run_id: self.run_id,
            inner: self.inner.lock(),
        }
    }

    pub fn advance(&self, to: RunState) -> Result<()> {
        self.lock().advance(to)
    }

    pub fn current(&self) -> RunState {
        self.inner.lock().state
    }

    pub fn history(&self) -> Vec<RunState> {
        self.inner.lock().history.clone()
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}
