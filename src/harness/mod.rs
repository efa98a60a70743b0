// Worker roles, run coordination and the prepare/execute handshake
pub mod context;
pub mod coordinator;
pub mod roles;
pub mod state;
pub mod worker;

pub use context::RunContext;
pub use coordinator::{Coordinator, RunSummary};
pub use roles::{Role, RolePlan, pick_target};
pub use state::{Phase, RunProgress, RunState};
pub use worker::{Consumed, WorkerReport, run_worker};
