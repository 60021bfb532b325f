use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::message::{Message, MessageFilter};
use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};

/// Message bus configuration.
#[derive(Debug, Clone)]
pub struct MessageBusConfig {
    /// Mailbox capacity for agents registered without an explicit one.
    pub default_capacity: usize,
    /// Messages retained in the history ring.
    pub history_size: usize,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            default_capacity: 100,
            history_size: 1000,
        }
    }
}

/// Bounded inbound queue for one agent. Both ends live in the bus so that
/// capacity checks and draining are bus operations.
struct MailboxSlot {
    queue: Mutex<VecDeque<Arc<Message>>>,
    capacity: usize,
    notify: Notify,
}

/// Bus counters.
#[derive(Debug, Default, Clone)]
pub struct MessageBusStats {
    pub total_messages: u64,
    pub direct_messages: u64,
    pub broadcast_messages: u64,
    pub response_matches: u64,
    pub failed_deliveries: u64,
    pub expired_messages: u64,
}

/// Mailbox-based message bus. At-most-once, ephemeral, FIFO per
/// (sender, recipient) pair. A send to a full mailbox fails immediately;
/// it never blocks the producer.
pub struct MessageBus {
    mailboxes: RwLock<HashMap<String, Arc<MailboxSlot>>>,
    topics: RwLock<HashMap<String, HashSet<String>>>,
    waiters: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Arc<Message>>>>>,
    history: RwLock<VecDeque<Arc<Message>>>,
    stats: RwLock<MessageBusStats>,
    config: MessageBusConfig,
}

/// A registered response slot. Created before the request is sent so the
/// response can never slip past the waiter.
pub struct PendingResponse {
    correlation_id: Uuid,
    rx: oneshot::Receiver<Arc<Message>>,
    waiters: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Arc<Message>>>>>,
}

impl PendingResponse {
    /// Wait for the paired response. Returns `None` on timeout.
    pub async fn wait(self, timeout: Duration) -> Option<Arc<Message>> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(message)) => Some(message),
            _ => {
                self.waiters.lock().await.remove(&self.correlation_id);
                None
            }
        }
    }
}

impl MessageBus {
    pub fn new(config: MessageBusConfig) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(MessageBusStats::default()),
            config,
        }
    }

    /// Register an agent mailbox. Re-registering replaces the mailbox and
    /// drops any queued mail.
    pub async fn register(&self, agent_id: impl Into<String>, capacity: Option<usize>) {
        let agent_id = agent_id.into();
        let slot = Arc::new(MailboxSlot {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.unwrap_or(self.config.default_capacity),
            notify: Notify::new(),
        });
        self.mailboxes.write().await.insert(agent_id.clone(), slot);
        info!("agent {} registered on message bus", agent_id);
    }

    pub async fn unregister(&self, agent_id: &str) {
        self.mailboxes.write().await.remove(agent_id);
        for subscribers in self.topics.write().await.values_mut() {
            subscribers.remove(agent_id);
        }
        info!("agent {} unregistered from message bus", agent_id);
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.mailboxes.read().await.contains_key(agent_id)
    }

    pub async fn registered_agents(&self) -> Vec<String> {
        self.mailboxes.read().await.keys().cloned().collect()
    }

    /// Send a directed message. Fails fast with `MailboxFull` when the
    /// target queue is at capacity; this is the backpressure signal.
    pub async fn send(&self, message: Message) -> Result<()> {
        if message.is_expired() {
            warn!("dropping expired message from {}", message.from);
            self.stats.write().await.expired_messages += 1;
            return Err(delivery_err("message expired before send"));
        }

        let message = Arc::new(message);
        self.push_history(message.clone()).await;

        // A response resolves a registered correlation waiter instead of
        // entering a mailbox. Requests never match: they still require a
        // response themselves.
        if let Some(correlation_id) = message.correlation_id
            && !message.requires_response
            && let Some(tx) = self.waiters.lock().await.remove(&correlation_id)
        {
            let mut stats = self.stats.write().await;
            stats.total_messages += 1;
            stats.response_matches += 1;
            drop(stats);
            let _ = tx.send(message);
            return Ok(());
        }

        let to = message
            .to
            .clone()
            .ok_or_else(|| delivery_err("directed send without a recipient"))?;

        match self.deliver(&to, message).await {
            Ok(()) => {
                let mut stats = self.stats.write().await;
                stats.total_messages += 1;
                stats.direct_messages += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.write().await.failed_deliveries += 1;
                Err(e)
            }
        }
    }

    /// Broadcast to a topic's subscribers, or to every registered agent
    /// except the sender when no topic is given. Best effort: full or
    /// missing mailboxes are skipped. Returns the delivered count.
    pub async fn broadcast(&self, message: Message, topic: Option<&str>) -> usize {
        if message.is_expired() {
            self.stats.write().await.expired_messages += 1;
            return 0;
        }

        let recipients: Vec<String> = match topic {
            Some(topic) => self
                .topics
                .read()
                .await
                .get(topic)
                .map(|subs| subs.iter().cloned().collect())
                .unwrap_or_default(),
            None => self
                .mailboxes
                .read()
                .await
                .keys()
                .filter(|id| **id != message.from)
                .cloned()
                .collect(),
        };

        let message = Arc::new(message);
        self.push_history(message.clone()).await;

        let mut delivered = 0;
        for recipient in recipients {
            match self.deliver(&recipient, message.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    debug!("broadcast skipped {}", recipient);
                    self.stats.write().await.failed_deliveries += 1;
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.total_messages += 1;
        stats.broadcast_messages += 1;
        drop(stats);

        delivered
    }

    pub async fn subscribe(&self, agent_id: impl Into<String>, topic: impl Into<String>) {
        let agent_id = agent_id.into();
        let topic = topic.into();
        self.topics
            .write()
            .await
            .entry(topic.clone())
            .or_default()
            .insert(agent_id.clone());
        debug!("agent {} subscribed to {}", agent_id, topic);
    }

    pub async fn unsubscribe(&self, agent_id: &str, topic: &str) {
        if let Some(subscribers) = self.topics.write().await.get_mut(topic) {
            subscribers.remove(agent_id);
        }
    }

    /// Drain an agent's mailbox, waiting up to `timeout` for mail to
    /// arrive. TTL-expired messages are dropped, never returned.
    pub async fn drain(&self, agent_id: &str, timeout: Duration) -> Result<Vec<Arc<Message>>> {
        let slot = self
            .mailboxes
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut expired = 0u64;
            let drained: Vec<Arc<Message>> = {
                let mut queue = slot.queue.lock().await;
                queue
                    .drain(..)
                    .filter(|msg| {
                        if msg.is_expired() {
                            expired += 1;
                            false
                        } else {
                            true
                        }
                    })
                    .collect()
            };

            if expired > 0 {
                self.stats.write().await.expired_messages += expired;
            }
            if !drained.is_empty() {
                return Ok(drained);
            }
            if tokio::time::timeout_at(deadline, slot.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    /// Register a response slot for `correlation_id` before the request
    /// goes out. At most one waiter per correlation id; a later waiter for
    /// the same id replaces the earlier one.
    pub async fn expect_response(&self, correlation_id: Uuid) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(correlation_id, tx);
        PendingResponse {
            correlation_id,
            rx,
            waiters: self.waiters.clone(),
        }
    }

    /// Wait for the response carrying `correlation_id`. Returns `None` on
    /// timeout.
    pub async fn await_response(
        &self,
        correlation_id: Uuid,
        timeout: Duration,
    ) -> Option<Arc<Message>> {
        self.expect_response(correlation_id).await.wait(timeout).await
    }

    /// Current queue depth per agent.
    pub async fn queue_depths(&self) -> HashMap<String, usize> {
        let mailboxes = self.mailboxes.read().await;
        let mut depths = HashMap::with_capacity(mailboxes.len());
        for (agent_id, slot) in mailboxes.iter() {
            depths.insert(agent_id.clone(), slot.queue.lock().await.len());
        }
        depths
    }

    pub async fn history(&self, filter: Option<MessageFilter>) -> Vec<Arc<Message>> {
        let history = self.history.read().await;
        match filter {
            Some(filter) => history
                .iter()
                .filter(|msg| filter.matches(msg))
                .cloned()
                .collect(),
            None => history.iter().cloned().collect(),
        }
    }

    pub async fn stats(&self) -> MessageBusStats {
        self.stats.read().await.clone()
    }

    async fn deliver(&self, recipient: &str, message: Arc<Message>) -> Result<()> {
        let slot = self
            .mailboxes
            .read()
            .await
            .get(recipient)
            .cloned()
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(recipient.to_string())))?;

        {
            let mut queue = slot.queue.lock().await;
            if queue.len() >= slot.capacity {
                warn!("mailbox full for {}", recipient);
                return Err(Error::CoordError(CoordError::MailboxFull(
                    recipient.to_string(),
                )));
            }
            queue.push_back(message);
        }
        slot.notify.notify_one();
        Ok(())
    }

    async fn push_history(&self, message: Arc<Message>) {
        let mut history = self.history.write().await;
        if history.len() >= self.config.history_size {
            history.pop_front();
        }
        history.push_back(message);
    }
}

fn delivery_err(reason: &str) -> Error {
    Error::CoordError(CoordError::DeliveryFailed(reason.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::bus::message::MessageContent;

    fn ping(from: &str, to: &str) -> Message {
        Message::new(
            from,
            to,
            MessageContent::KnowledgeShare {
                topic: "test".into(),
                payload: serde_json::json!({}),
            },
        )
    }

    #[tokio::test]
    async fn test_registration_and_send() {
        let bus = MessageBus::new(MessageBusConfig::default());
        bus.register("agent1", None).await;

        bus.send(ping("agent2", "agent1")).await.unwrap();

        let drained = bus.drain("agent1", Duration::from_millis(50)).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].from, "agent2");
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_fails() {
        let bus = MessageBus::new(MessageBusConfig::default());
        let err = bus.send(ping("a", "ghost")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CoordError(CoordError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mailbox_backpressure() {
        let bus = MessageBus::new(MessageBusConfig::default());
        bus.register("agent1", Some(2)).await;

        bus.send(ping("a", "agent1")).await.unwrap();
        bus.send(ping("a", "agent1")).await.unwrap();
        let err = bus.send(ping("a", "agent1")).await.unwrap_err();
        assert!(matches!(err, Error::CoordError(CoordError::MailboxFull(_))));

        // The two queued messages are intact.
        let drained = bus.drain("agent1", Duration::from_millis(10)).await.unwrap();
        assert_eq!(drained.len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_per_sender() {
        let bus = MessageBus::new(MessageBusConfig::default());
        bus.register("sink", None).await;

        for i in 0..5 {
            let msg = Message::new(
                "src",
                "sink",
                MessageContent::KnowledgeShare {
                    topic: format!("m{}", i),
                    payload: serde_json::json!(i),
                },
            );
            bus.send(msg).await.unwrap();
        }

        let drained = bus.drain("sink", Duration::from_millis(10)).await.unwrap();
        let topics: Vec<String> = drained
            .iter()
            .map(|m| match &m.content {
                MessageContent::KnowledgeShare { topic, .. } => topic.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(topics, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_broadcast_topic() {
        let bus = MessageBus::new(MessageBusConfig::default());
        bus.register("a", None).await;
        bus.register("b", None).await;
        bus.register("c", None).await;
        bus.subscribe("a", "alerts").await;
        bus.subscribe("b", "alerts").await;

        let msg = Message::broadcast(
            "monitor",
            MessageContent::Alert {
                severity: crate::bus::message::AlertSeverity::Warning,
                source: "test".into(),
                message: "hello".into(),
            },
        );
        let delivered = bus.broadcast(msg, Some("alerts")).await;
        assert_eq!(delivered, 2);

        assert!(bus.drain("c", Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_drops_expired() {
        let bus = MessageBus::new(MessageBusConfig::default());
        bus.register("agent1", None).await;

        let mut stale = ping("a", "agent1").with_ttl(1);
        stale.timestamp = Utc::now() - chrono::Duration::seconds(5);
        // Push directly past the expiry check in send().
        let slot = bus.mailboxes.read().await.get("agent1").cloned().unwrap();
        slot.queue.lock().await.push_back(Arc::new(stale));

        bus.send(ping("a", "agent1")).await.unwrap();

        let drained = bus.drain("agent1", Duration::from_millis(10)).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(!drained[0].is_expired());
        assert_eq!(bus.stats().await.expired_messages, 1);
    }

    #[tokio::test]
    async fn test_await_response_pairing() {
        let bus = Arc::new(MessageBus::new(MessageBusConfig::default()));
        bus.register("server", None).await;

        let corr = Uuid::new_v4();
        let request = Message::new(
            "client",
            "server",
            MessageContent::TaskRequest {
                task_id: "t1".into(),
                task_type: "echo".into(),
                payload: serde_json::json!({"v": 42}),
                shard: None,
            },
        )
        .with_correlation(corr)
        .expecting_response();
        bus.send(request).await.unwrap();

        let responder = bus.clone();
        tokio::spawn(async move {
            let inbox = responder
                .drain("server", Duration::from_millis(500))
                .await
                .unwrap();
            for msg in inbox {
                let reply = Message::response_to(
                    &msg,
                    "server",
                    MessageContent::TaskResponse {
                        task_id: "t1".into(),
                        success: true,
                        payload: serde_json::json!({"v": 42}),
                        error: None,
                    },
                );
                responder.send(reply).await.unwrap();
            }
        });

        let response = bus
            .await_response(corr, Duration::from_millis(500))
            .await
            .expect("response should arrive");
        assert_eq!(response.correlation_id, Some(corr));
        assert_eq!(response.from, "server");
    }

    #[tokio::test]
    async fn test_await_response_timeout() {
        let bus = MessageBus::new(MessageBusConfig::default());
        let got = bus
            .await_response(Uuid::new_v4(), Duration::from_millis(20))
            .await;
        assert!(got.is_none());
    }
}
