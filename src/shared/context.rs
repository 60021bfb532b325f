use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// System-wide configuration shared by every component.
///
/// All intervals are in seconds. Fractions are in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Default mailbox capacity for agents that do not specify one.
    pub mailbox_capacity: usize,
    /// Messages kept in the bus history ring.
    pub history_size: usize,
    /// Consecutive delivery failures before a destination breaker opens.
    pub breaker_failure_threshold: u32,
    /// Seconds an open breaker rejects before allowing a half-open trial.
    pub breaker_cooldown_secs: i64,
    /// Fraction of participants that must vote before a proposal resolves.
    pub quorum_fraction: f64,
    /// Fraction of received votes that must approve.
    pub approval_fraction: f64,
    /// Confidence weight in the auction score `amount - confidence * weight`.
    pub confidence_weight: f64,
    /// Registry health sweep period.
    pub registry_sweep_secs: u64,
    /// Silence after which an agent is flagged unhealthy.
    pub heartbeat_timeout_secs: i64,
    /// Resource sampling sweep period.
    pub resource_sweep_secs: u64,
    /// Usage history retention window.
    pub usage_retention_secs: i64,
    /// Rolling-average window for limit recommendations.
    pub recommend_window_secs: i64,
    /// Warning alert threshold as a fraction of the critical threshold.
    pub warning_fraction: f64,
    /// Critical alert threshold as a fraction of the critical threshold.
    pub critical_fraction: f64,
    /// Concurrent assigned tasks allowed per agent.
    pub concurrency_cap: usize,
    /// Minimum seconds between restarts of one agent.
    pub restart_cooldown_secs: i64,
    /// Task dispatcher period.
    pub dispatch_interval_secs: u64,
    /// Process/workflow monitor period.
    pub monitor_interval_secs: u64,
    /// Health ping period.
    pub health_ping_interval_secs: u64,
    /// Coordination deadline sweep period.
    pub coordination_sweep_secs: u64,
    /// Grace period before a stopping agent is force-killed.
    pub grace_period_secs: u64,
    /// Overall timeout for an assigned task without an explicit deadline.
    pub task_timeout_secs: i64,
    /// Default retry budget for failed tasks.
    pub max_task_retries: u32,
    /// Per-step timeout inside coordination patterns.
    pub step_timeout_secs: u64,
    /// Default wall-clock window for workflows, proposals and auctions.
    pub coordination_timeout_secs: u64,
    /// Restart dead agent processes automatically (still cooldown-gated).
    pub auto_restart: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 100,
            history_size: 1000,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 60,
            quorum_fraction: 0.6,
            approval_fraction: 0.6,
            confidence_weight: 10.0,
            registry_sweep_secs: 60,
            heartbeat_timeout_secs: 300,
            resource_sweep_secs: 30,
            usage_retention_secs: 86_400,
            recommend_window_secs: 21_600,
            warning_fraction: 0.80,
            critical_fraction: 0.95,
            concurrency_cap: 5,
            restart_cooldown_secs: 60,
            dispatch_interval_secs: 1,
            monitor_interval_secs: 5,
            health_ping_interval_secs: 30,
            coordination_sweep_secs: 5,
            grace_period_secs: 10,
            task_timeout_secs: 300,
            max_task_retries: 3,
            step_timeout_secs: 30,
            coordination_timeout_secs: 60,
            auto_restart: false,
        }
    }
}

/// Build and runtime information, fixed at startup.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        Self {
            start_time: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Process-wide context constructed once and passed by `Arc` to every
/// component. The single composition point; components never reach for
/// globals.
#[derive(Clone, Debug)]
pub struct SystemContext {
    pub config: Arc<RwLock<SystemConfig>>,
    pub runtime_info: Arc<RuntimeInfo>,
}

impl SystemContext {
    pub fn new(config: SystemConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            runtime_info: Arc::new(RuntimeInfo::default()),
        }
    }

    pub async fn get_config(&self) -> SystemConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config<F>(&self, updater: F)
    where
        F: FnOnce(&mut SystemConfig),
    {
        let mut config = self.config.write().await;
        updater(&mut config);
    }
}

impl Default for SystemContext {
    fn default() -> Self {
        Self::new(SystemConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_update() {
        let ctx = SystemContext::default();
        assert_eq!(ctx.get_config().await.concurrency_cap, 5);

        ctx.update_config(|c| c.concurrency_cap = 8).await;
        assert_eq!(ctx.get_config().await.concurrency_cap, 8);
    }
}
