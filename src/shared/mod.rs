pub mod context;
pub mod scheduler;
pub mod telemetry;

pub use context::{SystemConfig, SystemContext};
pub use scheduler::Scheduler;
