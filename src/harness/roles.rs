use std::fmt;

use crate::{HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Re-prepares other workers' statements and publishes a new version each time.
    Preparer,
    /// Waits for a fresh version on another worker's statement, then executes and fetches.
    Executor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Preparer => f.write_str("preparer"),
            Role::Executor => f.write_str("executor"),
        }
    }
}

/// Split of worker indices into preparers `[0, prepare_count)` and executors after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolePlan {
    thread_count: usize,
    prepare_count: usize,
}

impl RolePlan {
    /// Half the workers prepare, with at least one of each role.
    pub fn split(thread_count: usize) -> Result<Self> {
        if thread_count < 2 {
            return Err(HarnessError::InvalidConfig(
                "thread_count must be >= 2".to_string(),
            ));
        }

        let mut prepare_count = thread_count / 2;
        if prepare_count == 0 {
            prepare_count = 1;
        }
        if thread_count - prepare_count == 0 {
            prepare_count = thread_count - 1;
        }

        Ok(Self {
            thread_count,
            prepare_count,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn prepare_count(&self) -> usize {
        self.prepare_count
    }

    pub fn execute_count(&self) -> usize {
        self.thread_count - self.prepare_count
    }

    pub fn role_of(&self, index: usize) -> Role {
        if index < self.prepare_count {
            Role::Preparer
        } else {
            Role::Executor
        }
    }
}

/// Bundle a worker targets on a given iteration. Starts at the slot after the worker's own
/// and walks the pool; with two slots the walk returns to the worker's own slot every
/// other iteration.
pub fn pick_target(self_idx: usize, iter: usize, total: usize) -> usize {
    (self_idx + iter + 1) % total
}
