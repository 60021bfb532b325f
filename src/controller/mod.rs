pub mod controller;
pub mod process;
pub mod task_queue;

pub use controller::{AgentSpec, AgentStatus, Controller, SystemStatus};
pub use process::{LaunchSpec, ProcessHandle, ProcessLauncher, TokioProcessLauncher};
pub use task_queue::{AgentTask, TaskQueue, TaskQueueStats, TaskStatus};
