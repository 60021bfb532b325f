use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::bus::message::Message;
use crate::bus::message_bus::MessageBus;
use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};
use crate::registry::AgentRegistry;
use crate::store::MessageStore;
use crate::types::RoutingStrategy;

/// Delivery lifecycle: pending → delivered → {acknowledged | failed |
/// expired}. A pending message can also fail (breaker rejection) or expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Acknowledged,
    Failed,
    Expired,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Acknowledged => "acknowledged",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Acknowledged | DeliveryStatus::Failed | DeliveryStatus::Expired
        )
    }
}

/// Timing and routing figures gathered per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetrics {
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub route: Vec<String>,
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self {
            sent_at: Utc::now(),
            delivered_at: None,
            acked_at: None,
            retry_count: 0,
            route: Vec::new(),
        }
    }
}

/// A bus message with routing, lifecycle and persistence attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedMessage {
    pub message_id: Uuid,
    pub message: Message,
    pub conversation_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub delivery_status: DeliveryStatus,
    pub routing_strategy: RoutingStrategy,
    pub required_capabilities: Vec<String>,
    pub max_retries: u32,
    pub metrics: DeliveryMetrics,
    pub persistent: bool,
}

impl EnhancedMessage {
    /// Directed message to the target already named in `message.to`.
    pub fn direct(message: Message) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message,
            conversation_id: None,
            workflow_id: None,
            delivery_status: DeliveryStatus::Pending,
            routing_strategy: RoutingStrategy::Direct,
            required_capabilities: Vec::new(),
            max_retries: 3,
            metrics: DeliveryMetrics::default(),
            persistent: false,
        }
    }

    /// Message routed at send time over the given capabilities.
    pub fn routed(
        message: Message,
        strategy: RoutingStrategy,
        required_capabilities: Vec<String>,
    ) -> Self {
        let mut enhanced = Self::direct(message);
        enhanced.routing_strategy = strategy;
        enhanced.required_capabilities = required_capabilities;
        enhanced
    }

    pub fn with_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct EnhancedBusConfig {
    pub breaker: BreakerConfig,
    /// Lifetime of a non-terminal delivery record when the message carries
    /// no TTL of its own.
    pub default_record_ttl_secs: i64,
    /// Terminal records older than this are pruned by the sweep.
    pub prune_after_secs: i64,
}

impl Default for EnhancedBusConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            default_record_ttl_secs: 300,
            prune_after_secs: 3600,
        }
    }
}

/// Introspection snapshot of the routed bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusIntrospection {
    pub queue_depths: HashMap<String, usize>,
    pub inflight: HashMap<String, usize>,
    pub breaker_states: HashMap<String, BreakerState>,
    pub routing_counts: HashMap<RoutingStrategy, u64>,
    pub status_counts: HashMap<DeliveryStatus, u64>,
}

/// Routing layer over the core bus. Every delivery attempt passes the
/// destination's circuit breaker first; a rejected attempt never touches
/// the mailbox and is reported as a failure without internal retry.
pub struct EnhancedMessageBus {
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    records: RwLock<HashMap<Uuid, EnhancedMessage>>,
    inflight: RwLock<HashMap<String, usize>>,
    routing_counts: RwLock<HashMap<RoutingStrategy, u64>>,
    rr_counter: AtomicU64,
    store: Option<Arc<MessageStore>>,
    config: EnhancedBusConfig,
}

impl EnhancedMessageBus {
    pub fn new(
        bus: Arc<MessageBus>,
        registry: Arc<AgentRegistry>,
        store: Option<Arc<MessageStore>>,
        config: EnhancedBusConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            breakers: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            inflight: RwLock::new(HashMap::new()),
            routing_counts: RwLock::new(HashMap::new()),
            rr_counter: AtomicU64::new(0),
            store,
            config,
        }
    }

    pub fn core(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Route and deliver. Returns the message id for lifecycle calls.
    pub async fn send(&self, mut enhanced: EnhancedMessage) -> Result<Uuid> {
        let message_id = enhanced.message_id;
        enhanced.metrics.sent_at = Utc::now();
        enhanced.delivery_status = DeliveryStatus::Pending;
        self.records.write().await.insert(message_id, enhanced.clone());

        if enhanced.persistent
            && let Some(store) = &self.store
            && let Err(e) = store.record_message(&enhanced).await
        {
            warn!("durable log insert failed for {}: {}", message_id, e);
        }

        self.attempt(message_id).await?;
        Ok(message_id)
    }

    /// Re-attempt a failed delivery. Caller-driven; bounded by the
    /// message's retry budget.
    pub async fn retry(&self, message_id: Uuid) -> Result<()> {
        {
            let mut records = self.records.write().await;
            let record = records.get_mut(&message_id).ok_or_else(|| {
                Error::CoordError(CoordError::DeliveryFailed(format!(
                    "unknown message {}",
                    message_id
                )))
            })?;
            if record.delivery_status != DeliveryStatus::Failed {
                return Err(Error::CoordError(CoordError::InvalidState(format!(
                    "message {} is {}, not failed",
                    message_id,
                    record.delivery_status.as_str()
                ))));
            }
            if record.metrics.retry_count >= record.max_retries {
                return Err(Error::CoordError(CoordError::DeliveryFailed(format!(
                    "retry budget exhausted for {}",
                    message_id
                ))));
            }
            record.metrics.retry_count += 1;
            record.delivery_status = DeliveryStatus::Pending;
        }
        self.attempt(message_id).await?;
        Ok(())
    }

    /// Recipient acknowledgement; closes the delivery lifecycle.
    pub async fn acknowledge(&self, message_id: Uuid) -> Result<()> {
        let target = {
            let mut records = self.records.write().await;
            let record = records.get_mut(&message_id).ok_or_else(|| {
                Error::CoordError(CoordError::DeliveryFailed(format!(
                    "unknown message {}",
                    message_id
                )))
            })?;
            if record.delivery_status != DeliveryStatus::Delivered {
                return Err(Error::CoordError(CoordError::InvalidState(format!(
                    "message {} is {}, not delivered",
                    message_id,
                    record.delivery_status.as_str()
                ))));
            }
            record.delivery_status = DeliveryStatus::Acknowledged;
            record.metrics.acked_at = Some(Utc::now());
            record.metrics.route.last().cloned()
        };

        if let Some(agent) = target {
            self.dec_inflight(&agent).await;
        }
        self.persist_status(message_id).await;
        Ok(())
    }

    /// Recipient-reported failure of a delivered message.
    pub async fn fail(&self, message_id: Uuid) -> Result<()> {
        let target = {
            let mut records = self.records.write().await;
            let record = records.get_mut(&message_id).ok_or_else(|| {
                Error::CoordError(CoordError::DeliveryFailed(format!(
                    "unknown message {}",
                    message_id
                )))
            })?;
            let was_delivered = record.delivery_status == DeliveryStatus::Delivered;
            record.delivery_status = DeliveryStatus::Failed;
            if was_delivered {
                record.metrics.route.last().cloned()
            } else {
                None
            }
        };

        if let Some(agent) = target {
            self.dec_inflight(&agent).await;
        }
        self.persist_status(message_id).await;
        Ok(())
    }

    pub async fn delivery(&self, message_id: Uuid) -> Option<EnhancedMessage> {
        self.records.read().await.get(&message_id).cloned()
    }

    /// Expire stale non-terminal records and prune old terminal ones.
    pub async fn sweep_expiry(&self) -> Result<()> {
        let now = Utc::now();
        let default_ttl = Duration::seconds(self.config.default_record_ttl_secs);
        let prune_after = Duration::seconds(self.config.prune_after_secs);

        let mut expired_delivered = Vec::new();
        let mut expired_ids = Vec::new();
        {
            let mut records = self.records.write().await;
            for (id, record) in records.iter_mut() {
                if record.delivery_status.is_terminal() {
                    continue;
                }
                let stale = if record.message.ttl_secs.is_some() {
                    record.message.is_expired()
                } else {
                    now - record.metrics.sent_at > default_ttl
                };
                if stale {
                    if record.delivery_status == DeliveryStatus::Delivered
                        && let Some(agent) = record.metrics.route.last()
                    {
                        expired_delivered.push(agent.clone());
                    }
                    record.delivery_status = DeliveryStatus::Expired;
                    expired_ids.push(*id);
                }
            }
            records.retain(|_, record| {
                !(record.delivery_status.is_terminal()
                    && now - record.metrics.sent_at > prune_after)
            });
        }

        for agent in expired_delivered {
            self.dec_inflight(&agent).await;
        }
        for id in expired_ids {
            self.persist_status(id).await;
        }
        Ok(())
    }

    pub async fn breaker_state(&self, agent_id: &str) -> Option<BreakerState> {
        self.breakers.read().await.get(agent_id).map(|b| b.state())
    }

    pub async fn introspect(&self) -> BusIntrospection {
        let mut status_counts = HashMap::new();
        for record in self.records.read().await.values() {
            *status_counts.entry(record.delivery_status).or_insert(0) += 1;
        }

        BusIntrospection {
            queue_depths: self.bus.queue_depths().await,
            inflight: self.inflight.read().await.clone(),
            breaker_states: self
                .breakers
                .read()
                .await
                .iter()
                .map(|(id, b)| (id.clone(), b.state()))
                .collect(),
            routing_counts: self.routing_counts.read().await.clone(),
            status_counts,
        }
    }

    async fn attempt(&self, message_id: Uuid) -> Result<()> {
        let enhanced = self
            .records
            .read()
            .await
            .get(&message_id)
            .cloned()
            .ok_or_else(|| {
                Error::CoordError(CoordError::DeliveryFailed(format!(
                    "unknown message {}",
                    message_id
                )))
            })?;

        let now = Utc::now();
        self.bump_routing(enhanced.routing_strategy).await;

        let target = match self.resolve_route(&enhanced, now).await {
            Ok(target) => target,
            Err(e) => {
                self.mark_failed(message_id).await;
                return Err(e);
            }
        };

        {
            let mut breakers = self.breakers.write().await;
            let breaker = breakers
                .entry(target.clone())
                .or_insert_with(|| CircuitBreaker::new(self.config.breaker));
            if !breaker.try_acquire(now) {
                drop(breakers);
                debug!("breaker open, rejecting delivery to {}", target);
                self.mark_failed(message_id).await;
                return Err(Error::CoordError(CoordError::CircuitOpen(target)));
            }
        }

        let mut inner = enhanced.message.clone();
        inner.to = Some(target.clone());

        match self.bus.send(inner).await {
            Ok(()) => {
                if let Some(breaker) = self.breakers.write().await.get_mut(&target) {
                    breaker.record_success();
                }
                {
                    let mut records = self.records.write().await;
                    if let Some(record) = records.get_mut(&message_id) {
                        record.delivery_status = DeliveryStatus::Delivered;
                        record.metrics.delivered_at = Some(Utc::now());
                        record.metrics.route.push(target.clone());
                    }
                }
                *self.inflight.write().await.entry(target.clone()).or_insert(0) += 1;
                self.persist_status(message_id).await;
                debug!("message {} delivered to {}", message_id, target);
                Ok(())
            }
            Err(e) => {
                if let Some(breaker) = self.breakers.write().await.get_mut(&target) {
                    breaker.record_failure(Utc::now());
                }
                self.mark_failed(message_id).await;
                Err(e)
            }
        }
    }

    async fn resolve_route(
        &self,
        enhanced: &EnhancedMessage,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if enhanced.routing_strategy == RoutingStrategy::Direct {
            return enhanced.message.to.clone().ok_or_else(|| {
                Error::CoordError(CoordError::DeliveryFailed(
                    "direct send without a target".into(),
                ))
            });
        }

        let mut candidates = self
            .registry
            .find_capable(&enhanced.required_capabilities)
            .await;
        candidates.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let breakers = self.breakers.read().await;
        let callable: Vec<String> = candidates
            .into_iter()
            .filter(|record| {
                breakers
                    .get(&record.agent_id)
                    .map(|b| b.is_callable(now))
                    .unwrap_or(true)
            })
            .map(|record| record.agent_id)
            .collect();
        drop(breakers);

        if callable.is_empty() {
            return Err(Error::CoordError(CoordError::NoCapableAgent(
                enhanced.required_capabilities.join(","),
            )));
        }

        let chosen = match enhanced.routing_strategy {
            RoutingStrategy::LoadBalanced => {
                let inflight = self.inflight.read().await;
                let mut by_load: Vec<(usize, String)> = callable
                    .into_iter()
                    .map(|id| (inflight.get(&id).copied().unwrap_or(0), id))
                    .collect();
                by_load.sort();
                by_load.truncate(3);
                by_load.remove(0).1
            }
            RoutingStrategy::RoundRobin => {
                let index =
                    self.rr_counter.fetch_add(1, Ordering::Relaxed) as usize % callable.len();
                callable[index].clone()
            }
            _ => callable[0].clone(),
        };
        Ok(chosen)
    }

    async fn mark_failed(&self, message_id: Uuid) {
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&message_id) {
                record.delivery_status = DeliveryStatus::Failed;
            }
        }
        self.persist_status(message_id).await;
    }

    async fn persist_status(&self, message_id: Uuid) {
        let Some(store) = &self.store else {
            return;
        };
        let record = self.records.read().await.get(&message_id).cloned();
        if let Some(record) = record
            && record.persistent
            && let Err(e) = store.update_message_status(&record).await
        {
            warn!("durable log update failed for {}: {}", message_id, e);
        }
    }

    async fn bump_routing(&self, strategy: RoutingStrategy) {
        *self.routing_counts.write().await.entry(strategy).or_insert(0) += 1;
    }

    async fn dec_inflight(&self, agent_id: &str) {
        let mut inflight = self.inflight.write().await;
        if let Some(count) = inflight.get_mut(agent_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inflight.remove(agent_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::bus::message::MessageContent;
    use crate::bus::message_bus::MessageBusConfig;
    use crate::registry::{AgentRecord, RegistryConfig};

    fn request(to: Option<&str>) -> Message {
        let content = MessageContent::TaskRequest {
            task_id: "t".into(),
            task_type: "analysis".into(),
            payload: serde_json::json!({}),
            shard: None,
        };
        match to {
            Some(to) => Message::new("tester", to, content),
            None => Message::broadcast("tester", content),
        }
    }

    async fn harness(agents: &[&str]) -> (Arc<MessageBus>, Arc<AgentRegistry>, EnhancedMessageBus) {
        let bus = Arc::new(MessageBus::new(MessageBusConfig::default()));
        let registry = Arc::new(AgentRegistry::new(RegistryConfig::default(), None));
        for id in agents {
            bus.register(*id, None).await;
            let record = AgentRecord::new(
                *id,
                *id,
                "worker",
                "zone-a",
                ["analysis".to_string()],
            );
            registry.register(record).await.unwrap();
        }
        let enhanced = EnhancedMessageBus::new(
            bus.clone(),
            registry.clone(),
            None,
            EnhancedBusConfig::default(),
        );
        (bus, registry, enhanced)
    }

    #[tokio::test]
    async fn test_capability_send_reaches_exactly_one() {
        let (bus, _registry, enhanced) = harness(&["a", "b"]).await;

        enhanced
            .send(EnhancedMessage::routed(
                request(None),
                RoutingStrategy::CapabilityBased,
                vec!["analysis".to_string()],
            ))
            .await
            .unwrap();

        let a = bus.drain("a", StdDuration::from_millis(10)).await.unwrap();
        let b = bus.drain("b", StdDuration::from_millis(10)).await.unwrap();
        assert_eq!(a.len() + b.len(), 1);
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let (bus, _registry, enhanced) = harness(&["a", "b", "c"]).await;

        for _ in 0..6 {
            enhanced
                .send(EnhancedMessage::routed(
                    request(None),
                    RoutingStrategy::RoundRobin,
                    vec!["analysis".to_string()],
                ))
                .await
                .unwrap();
        }

        for id in ["a", "b", "c"] {
            let inbox = bus.drain(id, StdDuration::from_millis(10)).await.unwrap();
            assert_eq!(inbox.len(), 2, "agent {} should get 2 messages", id);
        }
    }

    #[tokio::test]
    async fn test_load_balanced_prefers_idle() {
        let (bus, _registry, enhanced) = harness(&["a", "b"]).await;

        // Three unacked deliveries pin "a" at a higher in-flight count.
        for _ in 0..3 {
            enhanced
                .send(EnhancedMessage::direct(request(Some("a"))))
                .await
                .unwrap();
        }

        enhanced
            .send(EnhancedMessage::routed(
                request(None),
                RoutingStrategy::LoadBalanced,
                vec!["analysis".to_string()],
            ))
            .await
            .unwrap();

        let b = bus.drain("b", StdDuration::from_millis(10)).await.unwrap();
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_skips_mailbox() {
        let (bus, _registry, enhanced) = harness(&["alive"]).await;
        // "dead" exists in the registry but has no mailbox, so deliveries
        // to it fail.
        let registry = enhanced.registry.clone();
        registry
            .register(AgentRecord::new(
                "dead",
                "dead",
                "worker",
                "zone-a",
                ["analysis".to_string()],
            ))
            .await
            .unwrap();

        for _ in 0..5 {
            let err = enhanced
                .send(EnhancedMessage::direct(request(Some("dead"))))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                Error::CoordError(CoordError::AgentNotFound(_))
            ));
        }
        assert_eq!(
            enhanced.breaker_state("dead").await,
            Some(BreakerState::Open)
        );

        // Register the mailbox now; the open breaker must still reject
        // without touching it.
        bus.register("dead", None).await;
        let err = enhanced
            .send(EnhancedMessage::direct(request(Some("dead"))))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CoordError(CoordError::CircuitOpen(_))));
        assert_eq!(bus.queue_depths().await.get("dead"), Some(&0));
    }

    #[tokio::test]
    async fn test_ack_closes_lifecycle_and_load() {
        let (_bus, _registry, enhanced) = harness(&["a"]).await;

        let id = enhanced
            .send(EnhancedMessage::direct(request(Some("a"))))
            .await
            .unwrap();
        assert_eq!(
            enhanced.delivery(id).await.unwrap().delivery_status,
            DeliveryStatus::Delivered
        );
        assert_eq!(enhanced.introspect().await.inflight.get("a"), Some(&1));

        enhanced.acknowledge(id).await.unwrap();
        let record = enhanced.delivery(id).await.unwrap();
        assert_eq!(record.delivery_status, DeliveryStatus::Acknowledged);
        assert!(record.metrics.acked_at.is_some());
        assert!(enhanced.introspect().await.inflight.get("a").is_none());
    }

    #[tokio::test]
    async fn test_retry_budget() {
        let (_bus, _registry, enhanced) = harness(&[]).await;
        let registry = enhanced.registry.clone();
        registry
            .register(AgentRecord::new(
                "ghost",
                "ghost",
                "worker",
                "z",
                ["analysis".to_string()],
            ))
            .await
            .unwrap();

        let message = EnhancedMessage::direct(request(Some("ghost"))).with_max_retries(1);
        let id = message.message_id;
        assert!(enhanced.send(message).await.is_err());

        assert!(enhanced.retry(id).await.is_err());
        // Budget of one retry is now spent.
        let err = enhanced.retry(id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CoordError(CoordError::DeliveryFailed(_))
        ));
    }
}
