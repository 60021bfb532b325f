use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::bus::message::{AlertSeverity, Message, MessageContent};
use crate::bus::message_bus::MessageBus;
use crate::error::Result;
use crate::monitor::sampler::{ResourceSampler, SystemUsage};
use crate::registry::AgentRegistry;
use crate::types::{ResourceSnapshot, ResourceVector};

/// Critical thresholds for system-wide figures, in percent.
#[derive(Debug, Clone, Copy)]
pub struct SystemThresholds {
    pub cpu_critical_percent: f64,
    pub memory_critical_percent: f64,
}

impl Default for SystemThresholds {
    fn default() -> Self {
        Self {
            cpu_critical_percent: 90.0,
            memory_critical_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sweep_interval_secs: u64,
    /// Usage history retention window.
    pub retention_secs: i64,
    /// Rolling-average window for recommendations.
    pub recommend_window_secs: i64,
    /// Warning fires at this fraction of the critical threshold.
    pub warning_fraction: f64,
    /// Critical fires at this fraction of the critical threshold.
    pub critical_fraction: f64,
    pub system: SystemThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            retention_secs: 86_400,
            recommend_window_secs: 21_600,
            warning_fraction: 0.80,
            critical_fraction: 0.95,
            system: SystemThresholds::default(),
        }
    }
}

/// One dimension over its configured limit.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub resource: String,
    pub usage: f64,
    pub limit: f64,
    /// Overshoot relative to the limit, in percent.
    pub violation_percent: f64,
}

/// Suggested limit change derived from the rolling average.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub resource: String,
    pub current_limit: f64,
    pub average_usage: f64,
    pub suggested_limit: f64,
}

/// Per-agent and system-wide resource tracking: limits, bounded usage
/// history, violation checks, limit recommendations and threshold alerts.
///
/// Alerts are edge-triggered with re-arm: a level fires once when first
/// crossed, escalates once from warning to critical, and re-arms after the
/// reading falls back below the warning line.
pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    registry: Arc<AgentRegistry>,
    bus: Option<Arc<MessageBus>>,
    limits: RwLock<HashMap<String, ResourceVector>>,
    history: RwLock<HashMap<String, VecDeque<ResourceSnapshot>>>,
    system_history: RwLock<VecDeque<(DateTime<Utc>, SystemUsage)>>,
    alert_levels: RwLock<HashMap<String, AlertSeverity>>,
    config: MonitorConfig,
}

impl ResourceMonitor {
    pub fn new(
        sampler: Arc<dyn ResourceSampler>,
        registry: Arc<AgentRegistry>,
        bus: Option<Arc<MessageBus>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            sampler,
            registry,
            bus,
            limits: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            system_history: RwLock::new(VecDeque::new()),
            alert_levels: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub async fn set_limit(&self, agent_id: impl Into<String>, limits: ResourceVector) {
        self.limits.write().await.insert(agent_id.into(), limits);
    }

    pub async fn get_limit(&self, agent_id: &str) -> Option<ResourceVector> {
        self.limits.read().await.get(agent_id).copied()
    }

    pub async fn remove_agent(&self, agent_id: &str) {
        self.limits.write().await.remove(agent_id);
        self.history.write().await.remove(agent_id);
        let prefix = format!("{agent_id}:");
        self.alert_levels
            .write()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
    }

    pub async fn latest_usage(&self, agent_id: &str) -> Option<ResourceSnapshot> {
        self.history
            .read()
            .await
            .get(agent_id)
            .and_then(|h| h.back().copied())
    }

    pub async fn usage_history(&self, agent_id: &str, window_secs: i64) -> Vec<ResourceSnapshot> {
        let cutoff = Utc::now() - Duration::seconds(window_secs);
        self.history
            .read()
            .await
            .get(agent_id)
            .map(|h| h.iter().filter(|s| s.taken_at >= cutoff).copied().collect())
            .unwrap_or_default()
    }

    pub async fn system_usage(&self) -> Option<SystemUsage> {
        self.system_history.read().await.back().map(|(_, u)| *u)
    }

    /// Compare the latest reading against the configured limits. Returns
    /// one entry per dimension over its limit.
    pub async fn check_violations(&self, agent_id: &str) -> Vec<Violation> {
        let Some(snapshot) = self.latest_usage(agent_id).await else {
            return Vec::new();
        };
        let Some(limits) = self.get_limit(agent_id).await else {
            return Vec::new();
        };

        snapshot
            .usage
            .dimensions()
            .iter()
            .zip(limits.dimensions().iter())
            .filter(|((_, usage), (_, limit))| *limit > 0.0 && *usage > *limit)
            .map(|((resource, usage), (_, limit))| Violation {
                resource: resource.to_string(),
                usage: *usage,
                limit: *limit,
                violation_percent: (usage - limit) / limit * 100.0,
            })
            .collect()
    }

    /// Propose limit adjustments from the rolling average: shrink when the
    /// average sits below half the limit, grow when it crowds past 90%.
    pub async fn recommend(&self, agent_id: &str) -> Vec<Recommendation> {
        let Some(limits) = self.get_limit(agent_id).await else {
            return Vec::new();
        };
        let window = self
            .usage_history(agent_id, self.config.recommend_window_secs)
            .await;
        if window.is_empty() {
            return Vec::new();
        }

        let n = window.len() as f64;
        let mut sums = [0.0f64; 5];
        for snapshot in &window {
            for (i, (_, value)) in snapshot.usage.dimensions().iter().enumerate() {
                sums[i] += value;
            }
        }

        limits
            .dimensions()
            .iter()
            .enumerate()
            .filter(|(_, (_, limit))| *limit > 0.0)
            .filter_map(|(i, (resource, limit))| {
                let average = sums[i] / n;
                let suggested = if average < 0.5 * limit {
                    average * 1.25
                } else if average > 0.9 * limit {
                    limit * 1.5
                } else {
                    return None;
                };
                Some(Recommendation {
                    resource: resource.to_string(),
                    current_limit: *limit,
                    average_usage: average,
                    suggested_limit: suggested,
                })
            })
            .collect()
    }

    /// Sampling sweep: refresh every registered agent with a pid, update
    /// the registry snapshot, evaluate alerts, then the system figures.
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();

        for record in self.registry.all_agents().await {
            let Some(pid) = record.pid else { continue };
            let usage = match self.sampler.sample_process(pid).await {
                Ok(usage) => usage,
                Err(e) => {
                    debug!("sampling {} (pid {}) failed: {}", record.agent_id, pid, e);
                    continue;
                }
            };

            self.push_history(&record.agent_id, ResourceSnapshot::new(usage), now)
                .await;
            if let Err(e) = self.registry.update_resources(&record.agent_id, usage).await {
                debug!("registry snapshot update failed: {}", e);
            }
            self.evaluate_agent_alerts(&record.agent_id, usage).await;
        }

        match self.sampler.sample_system().await {
            Ok(system) => {
                {
                    let mut history = self.system_history.write().await;
                    history.push_back((now, system));
                    let cutoff = now - Duration::seconds(self.config.retention_secs);
                    while history.front().is_some_and(|(t, _)| *t < cutoff) {
                        history.pop_front();
                    }
                }
                self.evaluate_system_alerts(system).await;
            }
            Err(e) => debug!("system sampling failed: {}", e),
        }

        Ok(())
    }

    async fn push_history(&self, agent_id: &str, snapshot: ResourceSnapshot, now: DateTime<Utc>) {
        let mut history = self.history.write().await;
        let entry = history.entry(agent_id.to_string()).or_default();
        entry.push_back(snapshot);
        let cutoff = now - Duration::seconds(self.config.retention_secs);
        while entry.front().is_some_and(|s| s.taken_at < cutoff) {
            entry.pop_front();
        }
    }

    async fn evaluate_agent_alerts(&self, agent_id: &str, usage: ResourceVector) {
        let Some(limits) = self.get_limit(agent_id).await else {
            return;
        };

        for ((resource, value), (_, limit)) in
            usage.dimensions().iter().zip(limits.dimensions().iter())
        {
            if *limit <= 0.0 {
                continue;
            }
            let level = self.classify(*value, *limit);
            self.transition_alert(
                format!("{agent_id}:{resource}"),
                level,
                format!(
                    "agent {} {} at {:.1} against limit {:.1}",
                    agent_id, resource, value, limit
                ),
            )
            .await;
        }
    }

    async fn evaluate_system_alerts(&self, system: SystemUsage) {
        let cpu_level = self.classify(system.cpu_percent, self.config.system.cpu_critical_percent);
        self.transition_alert(
            "system:cpu_percent".to_string(),
            cpu_level,
            format!("system cpu at {:.1}%", system.cpu_percent),
        )
        .await;

        if system.memory_total_mb > 0.0 {
            let used_percent = system.memory_used_mb / system.memory_total_mb * 100.0;
            let level =
                self.classify(used_percent, self.config.system.memory_critical_percent);
            self.transition_alert(
                "system:memory_percent".to_string(),
                level,
                format!("system memory at {:.1}%", used_percent),
            )
            .await;
        }
    }

    fn classify(&self, value: f64, critical_threshold: f64) -> Option<AlertSeverity> {
        if value >= self.config.critical_fraction * critical_threshold {
            Some(AlertSeverity::Critical)
        } else if value >= self.config.warning_fraction * critical_threshold {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }

    /// Edge-triggered alert bookkeeping: fire on first crossing or on
    /// escalation, re-arm once the reading clears the warning line.
    async fn transition_alert(&self, key: String, level: Option<AlertSeverity>, text: String) {
        let fire = {
            let mut levels = self.alert_levels.write().await;
            match level {
                None => {
                    levels.remove(&key);
                    None
                }
                Some(new_level) => {
                    let escalated = match levels.get(&key) {
                        None => true,
                        Some(previous) => new_level > *previous,
                    };
                    levels.insert(key.clone(), new_level);
                    escalated.then_some(new_level)
                }
            }
        };

        if let Some(severity) = fire {
            warn!("resource alert [{:?}] {}", severity, text);
            if let Some(bus) = &self.bus {
                let alert = Message::broadcast(
                    "resource_monitor",
                    MessageContent::Alert {
                        severity,
                        source: "resource_monitor".into(),
                        message: text,
                    },
                );
                bus.broadcast(alert, Some("alerts")).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::bus::message_bus::MessageBusConfig;
    use crate::registry::{AgentRecord, RegistryConfig};

    /// Sampler replaying a scripted sequence of readings.
    struct ScriptedSampler {
        readings: Mutex<Vec<ResourceVector>>,
    }

    impl ScriptedSampler {
        fn new(readings: Vec<ResourceVector>) -> Self {
            Self {
                readings: Mutex::new(readings),
            }
        }
    }

    #[async_trait::async_trait]
    impl ResourceSampler for ScriptedSampler {
        async fn sample_process(&self, _pid: u32) -> Result<ResourceVector> {
            let mut readings = self.readings.lock().unwrap();
            if readings.len() > 1 {
                Ok(readings.remove(0))
            } else {
                Ok(readings[0])
            }
        }

        async fn sample_system(&self) -> Result<SystemUsage> {
            Ok(SystemUsage::default())
        }
    }

    fn cpu(cpu_percent: f64) -> ResourceVector {
        ResourceVector {
            cpu_percent,
            ..Default::default()
        }
    }

    async fn harness(
        readings: Vec<ResourceVector>,
    ) -> (Arc<MessageBus>, Arc<AgentRegistry>, ResourceMonitor) {
        let bus = Arc::new(MessageBus::new(MessageBusConfig::default()));
        bus.register("listener", None).await;
        bus.subscribe("listener", "alerts").await;

        let registry = Arc::new(AgentRegistry::new(RegistryConfig::default(), None));
        let mut record = AgentRecord::new("a1", "a1", "worker", "z", ["x".to_string()]);
        record.pid = Some(4242);
        registry.register(record).await.unwrap();

        let monitor = ResourceMonitor::new(
            Arc::new(ScriptedSampler::new(readings)),
            registry.clone(),
            Some(bus.clone()),
            MonitorConfig::default(),
        );
        (bus, registry, monitor)
    }

    #[tokio::test]
    async fn test_violation_math() {
        let (_bus, _registry, monitor) = harness(vec![cpu(75.0)]).await;
        monitor
            .set_limit(
                "a1",
                ResourceVector {
                    cpu_percent: 50.0,
                    memory_mb: 1024.0,
                    ..Default::default()
                },
            )
            .await;
        monitor.sweep().await.unwrap();

        let violations = monitor.check_violations("a1").await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].resource, "cpu_percent");
        assert!((violations[0].violation_percent - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recommendations() {
        let (_bus, _registry, monitor) = harness(vec![cpu(10.0)]).await;
        monitor
            .set_limit(
                "a1",
                ResourceVector {
                    cpu_percent: 100.0,
                    ..Default::default()
                },
            )
            .await;
        monitor.sweep().await.unwrap();

        // Average 10% of a 100% limit: shrink proposal.
        let recs = monitor.recommend("a1").await;
        assert_eq!(recs.len(), 1);
        assert!(recs[0].suggested_limit < recs[0].current_limit);

        let (_bus, _registry, monitor) = harness(vec![cpu(95.0)]).await;
        monitor
            .set_limit(
                "a1",
                ResourceVector {
                    cpu_percent: 100.0,
                    ..Default::default()
                },
            )
            .await;
        monitor.sweep().await.unwrap();

        let recs = monitor.recommend("a1").await;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].suggested_limit, 150.0);
    }

    #[tokio::test]
    async fn test_alert_edge_trigger_and_rearm() {
        let (bus, _registry, monitor) =
            harness(vec![cpu(96.0), cpu(97.0), cpu(10.0), cpu(98.0)]).await;
        monitor
            .set_limit(
                "a1",
                ResourceVector {
                    cpu_percent: 100.0,
                    ..Default::default()
                },
            )
            .await;

        // First crossing fires one critical alert.
        monitor.sweep().await.unwrap();
        let inbox = bus.drain("listener", StdDuration::from_millis(10)).await.unwrap();
        assert_eq!(inbox.len(), 1);

        // Still over: no re-fire.
        monitor.sweep().await.unwrap();
        assert!(bus
            .drain("listener", StdDuration::from_millis(10))
            .await
            .unwrap()
            .is_empty());

        // Drops below the warning line: re-arm, silent.
        monitor.sweep().await.unwrap();
        assert!(bus
            .drain("listener", StdDuration::from_millis(10))
            .await
            .unwrap()
            .is_empty());

        // Crosses again: fires again.
        monitor.sweep().await.unwrap();
        let inbox = bus.drain("listener", StdDuration::from_millis(10)).await.unwrap();
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn test_history_feeds_registry_snapshot() {
        let (_bus, registry, monitor) = harness(vec![cpu(42.0)]).await;
        monitor.sweep().await.unwrap();

        let record = registry.get_agent("a1").await.unwrap();
        assert_eq!(record.resources.unwrap().usage.cpu_percent, 42.0);
        assert!(monitor.latest_usage("a1").await.is_some());
    }
}
