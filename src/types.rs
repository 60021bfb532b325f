use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent process as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Busy,
    Stopping,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Stopped => write!(f, "stopped"),
            AgentState::Starting => write!(f, "starting"),
            AgentState::Running => write!(f, "running"),
            AgentState::Busy => write!(f, "busy"),
            AgentState::Stopping => write!(f, "stopping"),
            AgentState::Error => write!(f, "error"),
        }
    }
}

/// Priority shared by messages and controller tasks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// All priorities, highest first. Dispatch order.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Routing strategy evaluated at send time by the enhanced bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    Direct,
    CapabilityBased,
    LoadBalanced,
    RoundRobin,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStrategy::Direct => write!(f, "direct"),
            RoutingStrategy::CapabilityBased => write!(f, "capability_based"),
            RoutingStrategy::LoadBalanced => write!(f, "load_balanced"),
            RoutingStrategy::RoundRobin => write!(f, "round_robin"),
        }
    }
}

/// One set of resource figures, used both as a configured limit and as a
/// sampled usage reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceVector {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub gpu_percent: f64,
    pub disk_mb: f64,
    pub network_mbps: f64,
}

impl ResourceVector {
    /// Iterate the dimensions as (name, value) pairs.
    pub fn dimensions(&self) -> [(&'static str, f64); 5] {
        [
            ("cpu_percent", self.cpu_percent),
            ("memory_mb", self.memory_mb),
            ("gpu_percent", self.gpu_percent),
            ("disk_mb", self.disk_mb),
            ("network_mbps", self.network_mbps),
        ]
    }
}

/// A usage reading with the time it was taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub usage: ResourceVector,
}

impl ResourceSnapshot {
    pub fn new(usage: ResourceVector) -> Self {
        Self {
            taken_at: Utc::now(),
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_resource_vector_dimensions() {
        let v = ResourceVector {
            cpu_percent: 50.0,
            memory_mb: 1024.0,
            ..Default::default()
        };
        let dims = v.dimensions();
        assert_eq!(dims[0], ("cpu_percent", 50.0));
        assert_eq!(dims[1], ("memory_mb", 1024.0));
    }
}
