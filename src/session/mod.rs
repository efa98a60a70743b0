// Shared state the workers contend over
pub mod barrier;
pub mod bundle;
pub mod pool;

pub use barrier::{PhaseBarrier, PhaseWait};
pub use bundle::{Freshness, Handles, ResourceBundle};
pub use pool::BundlePool;
