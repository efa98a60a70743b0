pub mod client;
pub mod config;
pub mod harness;
pub mod session;

use std::fmt;

use thiserror::Error;

pub use client::{ClientError, DbClient, Row};
pub use config::{Backend, Config, RunConfig};
pub use harness::{Coordinator, RunSummary, WorkerReport};

/// Client operations the harness issues, named the way diagnostics print them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    AllocStmt,
    Prepare,
    Execute,
    Fetch,
    CloseCursor,
    FreeStmt,
    Disconnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "Connect",
            Operation::AllocStmt => "AllocStmt",
            Operation::Prepare => "Prepare",
            Operation::Execute => "Execute",
            Operation::Fetch => "Fetch",
            Operation::CloseCursor => "CloseCursor",
            Operation::FreeStmt => "FreeStmt",
            Operation::Disconnect => "Disconnect",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{op} failed while opening bundle {slot}: {source}")]
    Setup {
        op: Operation,
        slot: usize,
        #[source]
        source: ClientError,
    },

    #[error("{op} failed on bundle {slot}: {source}")]
    Protocol {
        op: Operation,
        slot: usize,
        #[source]
        source: ClientError,
    },

    #[error("Failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Worker {0} panicked")]
    WorkerPanicked(usize),

    #[error("Illegal run state transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: harness::RunState,
        to: harness::RunState,
    },

    #[error("Run aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    /// Process exit code for this error. Usage errors follow clap's convention.
    pub fn exit_code(&self) -> u8 {
        match self {
            HarnessError::InvalidConfig(_) => 2,
            _ => 1,
        }
    }

    /// The bundle slot the error was raised against, if any.
    pub fn slot(&self) -> Option<usize> {
        match self {
            HarnessError::Setup { slot, .. } | HarnessError::Protocol { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// One-line diagnostic naming the operation and the client's error code and message.
    pub fn diagnostic(&self) -> String {
        match self {
            HarnessError::Setup { op, slot, source } | HarnessError::Protocol { op, slot, source } => {
                format!("ERROR : ({op}) bundle {slot}: [{}] {}", source.code, source.message)
            }
            other => format!("ERROR : {other}"),
        }
    }
}
