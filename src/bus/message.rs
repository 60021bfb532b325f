use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AgentState, Priority};

/// Shard assignment for scatter-gather requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub index: usize,
    pub total: usize,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Lifecycle events broadcast by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Created,
    Started,
    Stopped,
    Restarted,
    Crashed,
}

/// Control vocabulary carried inside `MessageContent::Coordination`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum CoordinationSignal {
    VoteRequest {
        proposal_id: Uuid,
        topic: String,
        payload: serde_json::Value,
        deadline: DateTime<Utc>,
    },
    Vote {
        proposal_id: Uuid,
        approve: bool,
        payload: serde_json::Value,
    },
    ConsensusResult {
        proposal_id: Uuid,
        approved: bool,
        timed_out: bool,
    },
    AuctionAnnouncement {
        auction_id: Uuid,
        task: serde_json::Value,
        required_capabilities: Vec<String>,
        closes_at: DateTime<Utc>,
    },
    Bid {
        auction_id: Uuid,
        amount: f64,
        confidence: f64,
        eta_secs: u64,
    },
    AuctionResult {
        auction_id: Uuid,
        won: bool,
        winning_amount: Option<f64>,
    },
    WorkflowUpdate {
        workflow_id: Uuid,
        completed: bool,
        detail: Option<String>,
    },
    Lifecycle {
        agent_id: String,
        event: LifecycleEvent,
    },
    Ping,
    Shutdown {
        reason: String,
    },
}

/// Message payload, one variant per message type. Fields are checked at
/// compile time rather than carried in free-form maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    TaskRequest {
        task_id: String,
        task_type: String,
        payload: serde_json::Value,
        shard: Option<Shard>,
    },
    TaskResponse {
        task_id: String,
        success: bool,
        payload: serde_json::Value,
        error: Option<String>,
    },
    StatusUpdate {
        agent_id: String,
        state: AgentState,
        detail: Option<String>,
    },
    ResourceRequest {
        resource: String,
        amount: f64,
    },
    KnowledgeShare {
        topic: String,
        payload: serde_json::Value,
    },
    Coordination {
        signal: CoordinationSignal,
    },
    Alert {
        severity: AlertSeverity,
        source: String,
        message: String,
    },
}

impl MessageContent {
    /// Wire name of the message type, used for stats and the durable log.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::TaskRequest { .. } => "task_request",
            MessageContent::TaskResponse { .. } => "task_response",
            MessageContent::StatusUpdate { .. } => "status_update",
            MessageContent::ResourceRequest { .. } => "resource_request",
            MessageContent::KnowledgeShare { .. } => "knowledge_share",
            MessageContent::Coordination { .. } => "coordination",
            MessageContent::Alert { .. } => "alert",
        }
    }
}

/// A message on the bus. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    /// `None` marks a broadcast.
    pub to: Option<String>,
    pub content: MessageContent,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    /// Pairs a request with its response.
    pub correlation_id: Option<Uuid>,
    pub requires_response: bool,
    /// Seconds until the message expires; expired messages are never drained.
    pub ttl_secs: Option<i64>,
}

impl Message {
    pub fn new(from: impl Into<String>, to: impl Into<String>, content: MessageContent) -> Self {
        Self {
            from: from.into(),
            to: Some(to.into()),
            content,
            priority: Priority::default(),
            timestamp: Utc::now(),
            correlation_id: None,
            requires_response: false,
            ttl_secs: None,
        }
    }

    pub fn broadcast(from: impl Into<String>, content: MessageContent) -> Self {
        Self {
            from: from.into(),
            to: None,
            content,
            priority: Priority::default(),
            timestamp: Utc::now(),
            correlation_id: None,
            requires_response: false,
            ttl_secs: None,
        }
    }

    /// Build the response to a request, carrying its correlation id back.
    pub fn response_to(request: &Message, from: impl Into<String>, content: MessageContent) -> Self {
        let mut msg = Self::new(from, request.from.clone(), content);
        msg.correlation_id = request.correlation_id;
        msg.priority = request.priority;
        msg
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    pub fn is_expired(&self) -> bool {
        match self.ttl_secs {
            Some(ttl) => Utc::now() - self.timestamp > Duration::seconds(ttl),
            None => false,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    pub fn kind(&self) -> &'static str {
        self.content.kind()
    }
}

/// History query filter.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub from: Option<String>,
    pub kinds: Option<Vec<&'static str>>,
    pub min_priority: Option<Priority>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sender(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<&'static str>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn with_min_priority(mut self, priority: Priority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(ref from) = self.from {
            if &message.from != from {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&message.kind()) {
                return false;
            }
        }

        if let Some(min_priority) = self.min_priority {
            if message.priority < min_priority {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MessageContent {
        MessageContent::TaskRequest {
            task_id: "t1".into(),
            task_type: "analysis".into(),
            payload: serde_json::json!({"input": 1}),
            shard: None,
        }
    }

    #[test]
    fn test_message_creation() {
        let msg = Message::new("agent1", "agent2", request());
        assert_eq!(msg.from, "agent1");
        assert_eq!(msg.to, Some("agent2".to_string()));
        assert!(!msg.is_broadcast());
        assert_eq!(msg.kind(), "task_request");
    }

    #[test]
    fn test_response_carries_correlation() {
        let corr = Uuid::new_v4();
        let req = Message::new("a", "b", request())
            .with_correlation(corr)
            .expecting_response();

        let resp = Message::response_to(
            &req,
            "b",
            MessageContent::TaskResponse {
                task_id: "t1".into(),
                success: true,
                payload: serde_json::json!({}),
                error: None,
            },
        );

        assert_eq!(resp.to, Some("a".to_string()));
        assert_eq!(resp.correlation_id, Some(corr));
        assert!(!resp.requires_response);
    }

    #[test]
    fn test_ttl_expiry() {
        let mut msg = Message::new("a", "b", request()).with_ttl(60);
        assert!(!msg.is_expired());

        msg.timestamp = Utc::now() - Duration::seconds(120);
        assert!(msg.is_expired());
    }

    #[test]
    fn test_content_roundtrip() {
        let msg = Message::broadcast(
            "monitor",
            MessageContent::Alert {
                severity: AlertSeverity::Critical,
                source: "resource_monitor".into(),
                message: "cpu over limit".into(),
            },
        );

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"alert\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_message_filter() {
        let msg = Message::new("agent1", "agent2", request()).with_priority(Priority::High);

        let filter = MessageFilter::new()
            .from_sender("agent1")
            .with_kinds(vec!["task_request"])
            .with_min_priority(crate::types::Priority::Normal);
        assert!(filter.matches(&msg));

        let filter = MessageFilter::new().with_min_priority(Priority::Critical);
        assert!(!filter.matches(&msg));
    }
}
