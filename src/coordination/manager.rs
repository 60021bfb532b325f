use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::message::{Message, MessageContent, Shard};
use crate::bus::message_bus::MessageBus;
use crate::coordination::auction::{AuctionConfig, AuctionManager, AuctionStatus};
use crate::coordination::consensus::{ConsensusConfig, ConsensusManager, ProposalStatus};
use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};
use crate::registry::AgentRegistry;
use crate::store::MessageStore;
use crate::types::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationPattern {
    Sequential,
    Parallel,
    Pipeline,
    ScatterGather,
    Consensus,
    Auction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl CoordinationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinationState::Completed
                | CoordinationState::Failed
                | CoordinationState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinationState::Pending => "pending",
            CoordinationState::InProgress => "in_progress",
            CoordinationState::Completed => "completed",
            CoordinationState::Failed => "failed",
            CoordinationState::Cancelled => "cancelled",
        }
    }
}

/// One multi-agent execution tracked by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationTask {
    pub id: Uuid,
    pub pattern: CoordinationPattern,
    pub participants: Vec<String>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub state: CoordinationState,
    /// In [0, 1], non-decreasing until terminal.
    pub progress: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub default_timeout_secs: u64,
    pub step_timeout_secs: u64,
    pub consensus: ConsensusConfig,
    pub auction: AuctionConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            step_timeout_secs: 30,
            consensus: ConsensusConfig::default(),
            auction: AuctionConfig::default(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CoordinationStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub pattern_usage: HashMap<CoordinationPattern, u64>,
}

/// Executes one coordination pattern per invocation over the bus, with
/// correlation-paired request/response per step. A deadline sweep cancels
/// overdue tasks and resolves expired proposals and auctions.
pub struct CoordinationManager {
    bus: Arc<MessageBus>,
    consensus: Arc<ConsensusManager>,
    auctions: Arc<AuctionManager>,
    tasks: RwLock<HashMap<Uuid, CoordinationTask>>,
    stats: RwLock<CoordinationStats>,
    store: Option<Arc<MessageStore>>,
    config: CoordinationConfig,
}

impl CoordinationManager {
    pub fn new(
        bus: Arc<MessageBus>,
        registry: Arc<AgentRegistry>,
        store: Option<Arc<MessageStore>>,
        config: CoordinationConfig,
    ) -> Self {
        let consensus = Arc::new(ConsensusManager::new(bus.clone(), config.consensus.clone()));
        let auctions = Arc::new(AuctionManager::new(
            bus.clone(),
            registry,
            config.auction.clone(),
        ));
        Self {
            bus,
            consensus,
            auctions,
            tasks: RwLock::new(HashMap::new()),
            stats: RwLock::new(CoordinationStats::default()),
            store,
            config,
        }
    }

    pub fn consensus(&self) -> &Arc<ConsensusManager> {
        &self.consensus
    }

    pub fn auctions(&self) -> &Arc<AuctionManager> {
        &self.auctions
    }

    /// Start a workflow; the pattern runs on a background task. Returns
    /// the workflow id for polling.
    pub async fn start_workflow(
        self: &Arc<Self>,
        pattern: CoordinationPattern,
        participants: Vec<String>,
        input: serde_json::Value,
        timeout_secs: Option<u64>,
    ) -> Result<Uuid> {
        if participants.is_empty() {
            return Err(Error::CoordError(CoordError::InvalidState(
                "workflow requires participants".into(),
            )));
        }

        let timeout = timeout_secs.unwrap_or(self.config.default_timeout_secs);
        let task = CoordinationTask {
            id: Uuid::new_v4(),
            pattern,
            participants: participants.clone(),
            input,
            output: None,
            state: CoordinationState::Pending,
            progress: 0.0,
            error: None,
            created_at: Utc::now(),
            deadline: Utc::now() + Duration::seconds(timeout as i64),
            completed_at: None,
        };
        let workflow_id = task.id;
        self.tasks.write().await.insert(workflow_id, task);
        *self
            .stats
            .write()
            .await
            .pattern_usage
            .entry(pattern)
            .or_insert(0) += 1;

        if let Some(store) = &self.store
            && let Err(e) = store
                .record_workflow(workflow_id, "pending", &serde_json::json!(participants))
                .await
        {
            warn!("workflow {} not persisted: {}", workflow_id, e);
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run(workflow_id).await;
        });

        info!("workflow {} started ({:?})", workflow_id, pattern);
        Ok(workflow_id)
    }

    pub async fn get_task(&self, workflow_id: Uuid) -> Option<CoordinationTask> {
        self.tasks.read().await.get(&workflow_id).cloned()
    }

    pub async fn active_tasks(&self) -> Vec<CoordinationTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> CoordinationStats {
        self.stats.read().await.clone()
    }

    /// Poll until the workflow reaches a terminal state or `timeout`.
    pub async fn wait_for(
        &self,
        workflow_id: Uuid,
        timeout: StdDuration,
    ) -> Option<CoordinationTask> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_task(workflow_id).await {
                Some(task) if task.state.is_terminal() => return Some(task),
                Some(_) => {}
                None => return None,
            }
            if tokio::time::Instant::now() >= deadline {
                return self.get_task(workflow_id).await;
            }
            tokio::time::sleep(StdDuration::from_millis(25)).await;
        }
    }

    /// Deadline sweep: cancel overdue coordination tasks and resolve
    /// expired proposals and auctions.
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        let cancelled: Vec<Uuid> = {
            let mut tasks = self.tasks.write().await;
            let mut cancelled = Vec::new();
            for task in tasks.values_mut() {
                if !task.state.is_terminal() && now > task.deadline {
                    task.state = CoordinationState::Cancelled;
                    task.error = Some("deadline exceeded".into());
                    task.completed_at = Some(now);
                    cancelled.push(task.id);
                }
            }
            cancelled
        };

        if !cancelled.is_empty() {
            let mut stats = self.stats.write().await;
            stats.tasks_cancelled += cancelled.len() as u64;
        }
        for workflow_id in cancelled {
            warn!("workflow {} cancelled: deadline exceeded", workflow_id);
            if let Some(store) = &self.store
                && let Err(e) = store.complete_workflow(workflow_id, "cancelled").await
            {
                debug!("workflow {} cancel not persisted: {}", workflow_id, e);
            }
        }

        self.consensus.sweep().await?;
        self.auctions.sweep().await?;
        Ok(())
    }

    async fn run(&self, workflow_id: Uuid) {
        let task = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&workflow_id) else {
                return;
            };
            if task.state != CoordinationState::Pending {
                return;
            }
            task.state = CoordinationState::InProgress;
            task.clone()
        };

        let outcome = match task.pattern {
            CoordinationPattern::Sequential => self.run_sequential(&task).await,
            CoordinationPattern::Parallel => self.run_parallel(&task).await,
            CoordinationPattern::Pipeline => self.run_pipeline(&task).await,
            CoordinationPattern::ScatterGather => self.run_scatter_gather(&task).await,
            CoordinationPattern::Consensus => self.run_consensus(&task).await,
            CoordinationPattern::Auction => self.run_auction(&task).await,
        };

        self.finalize(workflow_id, outcome).await;
    }

    /// Same input to each participant in order; the first failure aborts
    /// the remaining steps.
    async fn run_sequential(&self, task: &CoordinationTask) -> Result<serde_json::Value> {
        let total = task.participants.len();
        let mut results = Vec::with_capacity(total);
        for (step, participant) in task.participants.iter().enumerate() {
            let result = self
                .request(task.id, step, participant, task.input.clone(), None)
                .await?;
            results.push(result);
            self.set_progress(task.id, (step + 1) as f64 / total as f64)
                .await;
        }
        Ok(serde_json::json!(results))
    }

    /// Same input fanned to every participant concurrently; the join
    /// requires all of them to succeed.
    async fn run_parallel(&self, task: &CoordinationTask) -> Result<serde_json::Value> {
        let attempts = join_all(task.participants.iter().enumerate().map(
            |(step, participant)| self.request(task.id, step, participant, task.input.clone(), None),
        ))
        .await;

        let mut results = Vec::with_capacity(attempts.len());
        for attempt in attempts {
            results.push(attempt?);
        }
        Ok(serde_json::json!(results))
    }

    /// Each stage's emitted output becomes the next stage's input.
    async fn run_pipeline(&self, task: &CoordinationTask) -> Result<serde_json::Value> {
        let total = task.participants.len();
        let mut current = task.input.clone();
        for (step, participant) in task.participants.iter().enumerate() {
            current = self
                .request(task.id, step, participant, current, None)
                .await?;
            self.set_progress(task.id, (step + 1) as f64 / total as f64)
                .await;
        }
        Ok(current)
    }

    /// Shard the input by (index, total) per participant and collect what
    /// answers in time; the task fails only when every shard does.
    async fn run_scatter_gather(&self, task: &CoordinationTask) -> Result<serde_json::Value> {
        let total = task.participants.len();
        let attempts = join_all(task.participants.iter().enumerate().map(
            |(index, participant)| {
                let shard = Shard { index, total };
                self.request(task.id, index, participant, task.input.clone(), Some(shard))
            },
        ))
        .await;

        let mut results = Vec::new();
        let mut missing = Vec::new();
        for (index, attempt) in attempts.into_iter().enumerate() {
            match attempt {
                Ok(result) => results.push(serde_json::json!({
                    "shard": index,
                    "agent": task.participants[index],
                    "result": result,
                })),
                Err(e) => {
                    debug!("shard {} of {} failed: {}", index, task.id, e);
                    missing.push(task.participants[index].clone());
                }
            }
        }

        if results.is_empty() {
            return Err(Error::CoordError(CoordError::StepFailed(
                "all shards failed".into(),
            )));
        }
        Ok(serde_json::json!({"results": results, "missing": missing}))
    }

    async fn run_consensus(&self, task: &CoordinationTask) -> Result<serde_json::Value> {
        let window = (task.deadline - Utc::now()).num_seconds().max(1) as u64;
        let proposal_id = self
            .consensus
            .propose(
                "coordinator",
                format!("workflow:{}", task.id),
                task.input.clone(),
                task.participants.clone(),
                Some(window),
            )
            .await?;

        loop {
            let Some(proposal) = self.consensus.get_proposal(proposal_id).await else {
                return Err(Error::CoordError(CoordError::ProposalNotFound(
                    proposal_id.to_string(),
                )));
            };
            match proposal.status {
                ProposalStatus::Approved => {
                    return Ok(serde_json::json!({
                        "status": "approved",
                        "votes": proposal.votes.len(),
                    }));
                }
                ProposalStatus::Rejected => {
                    return Err(Error::CoordError(CoordError::StepFailed(
                        "proposal rejected".into(),
                    )));
                }
                ProposalStatus::Timeout => {
                    return Err(Error::CoordError(CoordError::Timeout(format!(
                        "proposal {} timed out",
                        proposal_id
                    ))));
                }
                ProposalStatus::Active => {
                    if Utc::now() > proposal.deadline {
                        self.consensus.sweep().await?;
                    }
                }
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
    }

    async fn run_auction(&self, task: &CoordinationTask) -> Result<serde_json::Value> {
        let window = (task.deadline - Utc::now()).num_seconds().max(1) as u64;
        let auction_id = self
            .auctions
            .start_scoped(task.input.clone(), task.participants.clone(), Some(window))
            .await?;

        loop {
            let Some(auction) = self.auctions.get_auction(auction_id).await else {
                return Err(Error::CoordError(CoordError::AuctionNotFound(
                    auction_id.to_string(),
                )));
            };
            match auction.status {
                AuctionStatus::Completed => {
                    let winning_amount = auction
                        .winner
                        .as_ref()
                        .and_then(|w| auction.bids.iter().find(|b| &b.agent == w))
                        .map(|b| b.amount);
                    return Ok(serde_json::json!({
                        "winner": auction.winner,
                        "winning_amount": winning_amount,
                        "bids": auction.bids.len(),
                    }));
                }
                AuctionStatus::Failed => {
                    return Err(Error::CoordError(CoordError::StepFailed(
                        "auction received no bids".into(),
                    )));
                }
                AuctionStatus::Active => {
                    if Utc::now() > auction.closes_at {
                        self.auctions.sweep().await?;
                    }
                }
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
    }

    /// One correlation-paired request/response exchange with a participant.
    async fn request(
        &self,
        workflow_id: Uuid,
        step: usize,
        participant: &str,
        payload: serde_json::Value,
        shard: Option<Shard>,
    ) -> Result<serde_json::Value> {
        let correlation_id = Uuid::new_v4();
        let request = Message::new(
            "coordinator",
            participant,
            MessageContent::TaskRequest {
                task_id: format!("{}:{}", workflow_id, step),
                task_type: "workflow_step".into(),
                payload,
                shard,
            },
        )
        .with_priority(Priority::High)
        .with_correlation(correlation_id)
        .expecting_response();

        // The slot goes in before the request so a fast responder cannot
        // beat the waiter.
        let pending = self.bus.expect_response(correlation_id).await;
        self.bus.send(request).await?;

        let response = pending
            .wait(StdDuration::from_secs(self.config.step_timeout_secs))
            .await
            .ok_or_else(|| {
                Error::CoordError(CoordError::Timeout(format!(
                    "step {} on {} got no response",
                    step, participant
                )))
            })?;

        match &response.content {
            MessageContent::TaskResponse {
                success: true,
                payload,
                ..
            } => Ok(payload.clone()),
            MessageContent::TaskResponse {
                success: false,
                error,
                ..
            } => Err(Error::CoordError(CoordError::StepFailed(format!(
                "{} step {}: {}",
                participant,
                step,
                error.clone().unwrap_or_else(|| "unspecified".into())
            )))),
            _ => Err(Error::CoordError(CoordError::StepFailed(format!(
                "{} step {}: unexpected response content",
                participant, step
            )))),
        }
    }

    async fn set_progress(&self, workflow_id: Uuid, progress: f64) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(&workflow_id)
            && !task.state.is_terminal()
        {
            task.progress = task.progress.max(progress.clamp(0.0, 1.0));
        }
    }

    async fn finalize(&self, workflow_id: Uuid, outcome: Result<serde_json::Value>) {
        let final_state = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&workflow_id) else {
                return;
            };
            // The deadline sweep may have cancelled it mid-run.
            if task.state.is_terminal() {
                return;
            }
            match outcome {
                Ok(output) => {
                    task.state = CoordinationState::Completed;
                    task.progress = 1.0;
                    task.output = Some(output);
                }
                Err(e) => {
                    task.state = CoordinationState::Failed;
                    task.error = Some(e.to_string());
                }
            }
            task.completed_at = Some(Utc::now());
            task.state
        };

        {
            let mut stats = self.stats.write().await;
            match final_state {
                CoordinationState::Completed => stats.tasks_completed += 1,
                CoordinationState::Failed => stats.tasks_failed += 1,
                _ => {}
            }
        }

        info!("workflow {} finished: {}", workflow_id, final_state.as_str());
        if let Some(store) = &self.store
            && let Err(e) = store
                .complete_workflow(workflow_id, final_state.as_str())
                .await
        {
            debug!("workflow {} completion not persisted: {}", workflow_id, e);
        }
    }
}
