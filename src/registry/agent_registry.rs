use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bus::message::{AlertSeverity, Message, MessageContent};
use crate::bus::message_bus::MessageBus;
use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};
use crate::types::{AgentState, ResourceSnapshot, ResourceVector};

/// Discovery record for one agent. Created on registration, mutated only
/// by heartbeats and the health sweep, removed on unregister.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub capabilities: HashSet<String>,
    pub state: AgentState,
    pub zone: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub resources: Option<ResourceSnapshot>,
    pub is_healthy: bool,
    pub error_count: u32,
}

impl AgentRecord {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
        zone: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            role: role.into(),
            capabilities: capabilities.into_iter().collect(),
            state: AgentState::Stopped,
            zone: zone.into(),
            pid: None,
            started_at: now,
            last_heartbeat: now,
            resources: None,
            is_healthy: true,
            error_count: 0,
        }
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_timeout_secs: i64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// Aggregate registry figures.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub agents_by_state: HashMap<String, usize>,
    pub agents_by_zone: HashMap<String, usize>,
    pub resource_totals: ResourceVector,
    pub resource_averages: ResourceVector,
}

/// Agent discovery: primary map plus inverted indices by zone and by
/// capability, so capability lookup is O(|capabilities|).
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentRecord>>>,
    zone_index: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    capability_index: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    bus: Option<Arc<MessageBus>>,
    config: RegistryConfig,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig, bus: Option<Arc<MessageBus>>) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            zone_index: Arc::new(RwLock::new(HashMap::new())),
            capability_index: Arc::new(RwLock::new(HashMap::new())),
            bus,
            config,
        }
    }

    /// Register an agent. `agent_id` is unique: an existing record under
    /// the same id is replaced, with its index entries rebuilt.
    pub async fn register(&self, record: AgentRecord) -> Result<()> {
        let agent_id = record.agent_id.clone();
        if self.agents.read().await.contains_key(&agent_id) {
            self.remove_from_indices(&agent_id).await;
        }

        self.zone_index
            .write()
            .await
            .entry(record.zone.clone())
            .or_default()
            .insert(agent_id.clone());

        let mut cap_index = self.capability_index.write().await;
        for capability in &record.capabilities {
            cap_index
                .entry(capability.clone())
                .or_default()
                .insert(agent_id.clone());
        }
        drop(cap_index);

        self.agents.write().await.insert(agent_id.clone(), record);
        info!("agent {} registered", agent_id);
        Ok(())
    }

    pub async fn unregister(&self, agent_id: &str) -> Result<()> {
        self.agents
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;
        self.remove_from_indices(agent_id).await;
        info!("agent {} unregistered", agent_id);
        Ok(())
    }

    /// Refresh the heartbeat, optionally merging a resource reading, and
    /// restore health.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        metrics: Option<ResourceVector>,
    ) -> Result<()> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;

        record.last_heartbeat = Utc::now();
        if let Some(usage) = metrics {
            record.resources = Some(ResourceSnapshot::new(usage));
        }
        if !record.is_healthy {
            info!("agent {} healthy again", agent_id);
        }
        record.is_healthy = true;
        Ok(())
    }

    pub async fn update_state(&self, agent_id: &str, state: AgentState) -> Result<()> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;
        debug!("agent {} state {} -> {}", agent_id, record.state, state);
        record.state = state;
        Ok(())
    }

    pub async fn update_pid(&self, agent_id: &str, pid: Option<u32>) -> Result<()> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;
        record.pid = pid;
        if pid.is_some() {
            record.started_at = Utc::now();
        }
        Ok(())
    }

    pub async fn update_resources(&self, agent_id: &str, usage: ResourceVector) -> Result<()> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;
        record.resources = Some(ResourceSnapshot::new(usage));
        Ok(())
    }

    pub async fn record_error(&self, agent_id: &str) -> Result<u32> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;
        record.error_count += 1;
        Ok(record.error_count)
    }

    /// Replace an agent's advertised capability set.
    pub async fn update_capabilities(
        &self,
        agent_id: &str,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Result<()> {
        let capabilities: HashSet<String> = capabilities.into_iter().collect();
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;

        let mut cap_index = self.capability_index.write().await;
        for capability in &record.capabilities {
            if let Some(holders) = cap_index.get_mut(capability) {
                holders.remove(agent_id);
                if holders.is_empty() {
                    cap_index.remove(capability);
                }
            }
        }
        for capability in &capabilities {
            cap_index
                .entry(capability.clone())
                .or_default()
                .insert(agent_id.to_string());
        }
        record.capabilities = capabilities;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn all_agents(&self) -> Vec<AgentRecord> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn find_by_zone(&self, zone: &str) -> Vec<AgentRecord> {
        let zone_index = self.zone_index.read().await;
        let agents = self.agents.read().await;
        zone_index
            .get(zone)
            .map(|ids| ids.iter().filter_map(|id| agents.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn find_by_state(&self, state: AgentState) -> Vec<AgentRecord> {
        self.agents
            .read()
            .await
            .values()
            .filter(|record| record.state == state)
            .cloned()
            .collect()
    }

    pub async fn find_by_capability(&self, capability: &str) -> Vec<AgentRecord> {
        let cap_index = self.capability_index.read().await;
        let agents = self.agents.read().await;
        cap_index
            .get(capability)
            .map(|ids| ids.iter().filter_map(|id| agents.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Healthy agents whose capability set covers every required one.
    /// Unhealthy agents are excluded from routing until they heartbeat.
    pub async fn find_capable(&self, required: &[String]) -> Vec<AgentRecord> {
        if required.is_empty() {
            return self.healthy_agents().await;
        }

        // Intersect starting from the first capability's holders.
        let cap_index = self.capability_index.read().await;
        let Some(seed) = cap_index.get(&required[0]) else {
            return Vec::new();
        };
        let candidate_ids: Vec<String> = seed.iter().cloned().collect();
        drop(cap_index);

        let agents = self.agents.read().await;
        candidate_ids
            .iter()
            .filter_map(|id| agents.get(id))
            .filter(|record| record.is_healthy && record.has_capabilities(required))
            .cloned()
            .collect()
    }

    pub async fn healthy_agents(&self) -> Vec<AgentRecord> {
        self.agents
            .read()
            .await
            .values()
            .filter(|record| record.is_healthy)
            .cloned()
            .collect()
    }

    /// Health sweep: flag agents whose heartbeat is older than the timeout.
    /// Edge-triggered: each silence flips `is_healthy` once and emits one
    /// alert; nothing re-fires while the agent stays silent. Returns the
    /// newly-unhealthy agent ids.
    pub async fn sweep_health(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let timeout = Duration::seconds(self.config.heartbeat_timeout_secs);

        let mut flipped = Vec::new();
        {
            let mut agents = self.agents.write().await;
            for record in agents.values_mut() {
                if record.is_healthy && now - record.last_heartbeat > timeout {
                    record.is_healthy = false;
                    flipped.push(record.agent_id.clone());
                }
            }
        }

        for agent_id in &flipped {
            warn!("agent {} missed heartbeat window", agent_id);
            if let Some(bus) = &self.bus {
                let alert = Message::broadcast(
                    "registry",
                    MessageContent::Alert {
                        severity: AlertSeverity::Warning,
                        source: "registry".into(),
                        message: format!("agent {} missed heartbeat window", agent_id),
                    },
                );
                bus.broadcast(alert, Some("alerts")).await;
            }
        }

        Ok(flipped)
    }

    pub async fn stats(&self) -> RegistryStats {
        let agents = self.agents.read().await;

        let mut by_state: HashMap<String, usize> = HashMap::new();
        let mut by_zone: HashMap<String, usize> = HashMap::new();
        let mut totals = ResourceVector::default();
        let mut sampled = 0usize;

        for record in agents.values() {
            *by_state.entry(record.state.to_string()).or_insert(0) += 1;
            *by_zone.entry(record.zone.clone()).or_insert(0) += 1;
            if let Some(snapshot) = &record.resources {
                totals.cpu_percent += snapshot.usage.cpu_percent;
                totals.memory_mb += snapshot.usage.memory_mb;
                totals.gpu_percent += snapshot.usage.gpu_percent;
                totals.disk_mb += snapshot.usage.disk_mb;
                totals.network_mbps += snapshot.usage.network_mbps;
                sampled += 1;
            }
        }

        let averages = if sampled > 0 {
            let n = sampled as f64;
            ResourceVector {
                cpu_percent: totals.cpu_percent / n,
                memory_mb: totals.memory_mb / n,
                gpu_percent: totals.gpu_percent / n,
                disk_mb: totals.disk_mb / n,
                network_mbps: totals.network_mbps / n,
            }
        } else {
            ResourceVector::default()
        };

        RegistryStats {
            total_agents: agents.len(),
            healthy_agents: agents.values().filter(|a| a.is_healthy).count(),
            agents_by_state: by_state,
            agents_by_zone: by_zone,
            resource_totals: totals,
            resource_averages: averages,
        }
    }

    async fn remove_from_indices(&self, agent_id: &str) {
        let mut zone_index = self.zone_index.write().await;
        zone_index.retain(|_, ids| {
            ids.remove(agent_id);
            !ids.is_empty()
        });
        drop(zone_index);

        let mut cap_index = self.capability_index.write().await;
        cap_index.retain(|_, ids| {
            ids.remove(agent_id);
            !ids.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, zone: &str, caps: &[&str]) -> AgentRecord {
        AgentRecord::new(
            id,
            id,
            "worker",
            zone,
            caps.iter().map(|c| c.to_string()),
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = AgentRegistry::new(RegistryConfig::default(), None);
        registry
            .register(record("a1", "zone-a", &["analysis"]))
            .await
            .unwrap();

        let found = registry.get_agent("a1").await.unwrap();
        assert_eq!(found.agent_id, "a1");
        assert_eq!(found.state, AgentState::Stopped);
        assert!(found.is_healthy);

        assert_eq!(registry.find_by_zone("zone-a").await.len(), 1);
        assert_eq!(registry.find_by_capability("analysis").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_cleans_indices() {
        let registry = AgentRegistry::new(RegistryConfig::default(), None);
        registry
            .register(record("a1", "zone-a", &["analysis", "search"]))
            .await
            .unwrap();
        registry.unregister("a1").await.unwrap();

        assert!(registry.get_agent("a1").await.is_none());
        assert!(registry.find_by_zone("zone-a").await.is_empty());
        assert!(registry.find_by_capability("analysis").await.is_empty());
    }

    #[tokio::test]
    async fn test_find_capable_requires_superset() {
        let registry = AgentRegistry::new(RegistryConfig::default(), None);
        registry
            .register(record("a1", "z", &["analysis"]))
            .await
            .unwrap();
        registry
            .register(record("a2", "z", &["analysis", "summarize"]))
            .await
            .unwrap();

        let both = registry.find_capable(&["analysis".to_string()]).await;
        assert_eq!(both.len(), 2);

        let one = registry
            .find_capable(&["analysis".to_string(), "summarize".to_string()])
            .await;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].agent_id, "a2");
    }

    #[tokio::test]
    async fn test_health_sweep_edge_triggered() {
        let registry = AgentRegistry::new(
            RegistryConfig {
                heartbeat_timeout_secs: 0,
                sweep_interval_secs: 60,
            },
            None,
        );
        registry.register(record("a1", "z", &["analysis"])).await.unwrap();

        // Age the heartbeat past the (zero) timeout.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let flipped = registry.sweep_health().await.unwrap();
        assert_eq!(flipped, vec!["a1".to_string()]);
        assert!(!registry.get_agent("a1").await.unwrap().is_healthy);

        // Still silent: no second emission.
        let flipped = registry.sweep_health().await.unwrap();
        assert!(flipped.is_empty());

        // Unhealthy agents are excluded from capability routing.
        assert!(registry.find_capable(&["analysis".to_string()]).await.is_empty());

        // A heartbeat restores health and routing.
        registry.heartbeat("a1", None).await.unwrap();
        assert_eq!(registry.find_capable(&["analysis".to_string()]).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let registry = AgentRegistry::new(RegistryConfig::default(), None);
        registry.register(record("a1", "z1", &["x"])).await.unwrap();
        registry.register(record("a2", "z2", &["x"])).await.unwrap();
        registry
            .update_resources(
                "a1",
                ResourceVector {
                    cpu_percent: 40.0,
                    memory_mb: 512.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        registry
            .update_resources(
                "a2",
                ResourceVector {
                    cpu_percent: 20.0,
                    memory_mb: 256.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = registry.stats().await;
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.resource_totals.cpu_percent, 60.0);
        assert_eq!(stats.resource_averages.memory_mb, 384.0);
    }
}
