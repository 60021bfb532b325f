pub mod resource_monitor;
pub mod sampler;

pub use resource_monitor::{
    MonitorConfig, Recommendation, ResourceMonitor, SystemThresholds, Violation,
};
pub use sampler::{ProcSampler, ResourceSampler, SystemUsage};
