use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::message::{CoordinationSignal, Message, MessageContent};
use crate::bus::message_bus::MessageBus;
use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Active,
    Approved,
    Rejected,
    Timeout,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        *self != ProposalStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRecord {
    pub approve: bool,
    pub payload: serde_json::Value,
    pub cast_at: DateTime<Utc>,
}

/// A proposal under vote. Status is terminal once set; late or duplicate
/// votes never reopen it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub id: Uuid,
    pub proposer: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub participants: Vec<String>,
    pub votes: HashMap<String, VoteRecord>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Fraction of participants whose votes must be in before evaluating.
    pub quorum_fraction: f64,
    /// Fraction of received votes that must approve.
    pub approval_fraction: f64,
    pub default_window_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum_fraction: 0.6,
            approval_fraction: 0.6,
            default_window_secs: 30,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConsensusStats {
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

/// Quorum voting. A vote request goes to every participant except the
/// proposer; on each recorded vote, once the quorum fraction of
/// participants has voted, the proposal resolves to approved or rejected
/// by the approval fraction of the votes received. The window elapsing
/// first resolves it to timeout. Every participant is told the outcome
/// exactly once.
pub struct ConsensusManager {
    bus: Arc<MessageBus>,
    proposals: RwLock<HashMap<Uuid, ConsensusProposal>>,
    stats: RwLock<ConsensusStats>,
    config: ConsensusConfig,
}

impl ConsensusManager {
    pub fn new(bus: Arc<MessageBus>, config: ConsensusConfig) -> Self {
        Self {
            bus,
            proposals: RwLock::new(HashMap::new()),
            stats: RwLock::new(ConsensusStats::default()),
            config,
        }
    }

    /// Open a proposal and broadcast the vote request.
    pub async fn propose(
        &self,
        proposer: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        participants: Vec<String>,
        window_secs: Option<u64>,
    ) -> Result<Uuid> {
        let proposer = proposer.into();
        let topic = topic.into();
        if participants.is_empty() {
            return Err(Error::CoordError(CoordError::InvalidState(
                "consensus requires participants".into(),
            )));
        }

        let window = window_secs.unwrap_or(self.config.default_window_secs);
        let proposal = ConsensusProposal {
            id: Uuid::new_v4(),
            proposer: proposer.clone(),
            topic: topic.clone(),
            payload: payload.clone(),
            participants: participants.clone(),
            votes: HashMap::new(),
            status: ProposalStatus::Active,
            created_at: Utc::now(),
            deadline: Utc::now() + Duration::seconds(window as i64),
        };
        let proposal_id = proposal.id;
        let deadline = proposal.deadline;
        self.proposals.write().await.insert(proposal_id, proposal);

        for participant in participants.iter().filter(|p| **p != proposer) {
            let request = Message::new(
                proposer.clone(),
                participant,
                MessageContent::Coordination {
                    signal: CoordinationSignal::VoteRequest {
                        proposal_id,
                        topic: topic.clone(),
                        payload: payload.clone(),
                        deadline,
                    },
                },
            );
            if let Err(e) = self.bus.send(request).await {
                warn!("vote request to {} failed: {}", participant, e);
            }
        }

        info!("proposal {} opened by {} ({})", proposal_id, proposer, topic);
        Ok(proposal_id)
    }

    /// Record one vote. Returns the proposal status after evaluation.
    /// Votes on a terminal proposal, duplicates, and non-participants are
    /// ignored.
    pub async fn record_vote(
        &self,
        proposal_id: Uuid,
        voter: &str,
        approve: bool,
        payload: serde_json::Value,
    ) -> Result<ProposalStatus> {
        let resolved = {
            let mut proposals = self.proposals.write().await;
            let proposal = proposals.get_mut(&proposal_id).ok_or_else(|| {
                Error::CoordError(CoordError::ProposalNotFound(proposal_id.to_string()))
            })?;

            if proposal.status.is_terminal() {
                debug!("late vote from {} on {}", voter, proposal_id);
                return Ok(proposal.status);
            }
            if !proposal.participants.iter().any(|p| p == voter) {
                return Err(Error::CoordError(CoordError::InvalidState(format!(
                    "{} is not a participant of {}",
                    voter, proposal_id
                ))));
            }
            if proposal.votes.contains_key(voter) {
                debug!("duplicate vote from {} on {}", voter, proposal_id);
                return Ok(proposal.status);
            }

            proposal.votes.insert(
                voter.to_string(),
                VoteRecord {
                    approve,
                    payload,
                    cast_at: Utc::now(),
                },
            );

            let total = proposal.participants.len() as f64;
            let votes = proposal.votes.len() as f64;
            if votes >= self.config.quorum_fraction * total {
                let approvals =
                    proposal.votes.values().filter(|v| v.approve).count() as f64;
                proposal.status = if approvals >= self.config.approval_fraction * votes {
                    ProposalStatus::Approved
                } else {
                    ProposalStatus::Rejected
                };
                Some(proposal.clone())
            } else {
                None
            }
        };

        match resolved {
            Some(proposal) => {
                self.conclude(&proposal).await;
                Ok(proposal.status)
            }
            None => Ok(ProposalStatus::Active),
        }
    }

    pub async fn get_proposal(&self, proposal_id: Uuid) -> Option<ConsensusProposal> {
        self.proposals.read().await.get(&proposal_id).cloned()
    }

    pub async fn stats(&self) -> ConsensusStats {
        self.stats.read().await.clone()
    }

    /// Resolve proposals whose window elapsed without quorum.
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        let timed_out: Vec<ConsensusProposal> = {
            let mut proposals = self.proposals.write().await;
            proposals
                .values_mut()
                .filter(|p| !p.status.is_terminal() && now > p.deadline)
                .map(|p| {
                    p.status = ProposalStatus::Timeout;
                    p.clone()
                })
                .collect()
        };

        for proposal in &timed_out {
            warn!("proposal {} timed out", proposal.id);
            self.conclude(proposal).await;
        }
        Ok(())
    }

    /// Notify every participant (and the proposer) of the terminal result.
    /// Called exactly once per proposal, at the terminal transition.
    async fn conclude(&self, proposal: &ConsensusProposal) {
        {
            let mut stats = self.stats.write().await;
            match proposal.status {
                ProposalStatus::Approved => stats.approved += 1,
                ProposalStatus::Rejected => stats.rejected += 1,
                ProposalStatus::Timeout => stats.timed_out += 1,
                ProposalStatus::Active => {}
            }
        }

        let mut recipients = proposal.participants.clone();
        if !recipients.iter().any(|p| *p == proposal.proposer) {
            recipients.push(proposal.proposer.clone());
        }

        for recipient in recipients {
            let result = Message::new(
                "consensus",
                &recipient,
                MessageContent::Coordination {
                    signal: CoordinationSignal::ConsensusResult {
                        proposal_id: proposal.id,
                        approved: proposal.status == ProposalStatus::Approved,
                        timed_out: proposal.status == ProposalStatus::Timeout,
                    },
                },
            );
            if let Err(e) = self.bus.send(result).await {
                debug!("consensus result to {} failed: {}", recipient, e);
            }
        }

        info!("proposal {} resolved: {:?}", proposal.id, proposal.status);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::bus::message_bus::MessageBusConfig;

    async fn harness(participants: &[&str]) -> (Arc<MessageBus>, ConsensusManager) {
        let bus = Arc::new(MessageBus::new(MessageBusConfig::default()));
        for p in participants {
            bus.register(*p, None).await;
        }
        let manager = ConsensusManager::new(bus.clone(), ConsensusConfig::default());
        (bus, manager)
    }

    fn names(participants: &[&str]) -> Vec<String> {
        participants.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_quorum_approval_without_waiting() {
        let all = ["p1", "p2", "p3", "p4", "p5"];
        let (_bus, manager) = harness(&all).await;
        let id = manager
            .propose("p1", "upgrade", serde_json::json!({}), names(&all), None)
            .await
            .unwrap();

        assert_eq!(
            manager.record_vote(id, "p2", true, serde_json::json!({})).await.unwrap(),
            ProposalStatus::Active
        );
        assert_eq!(
            manager.record_vote(id, "p3", true, serde_json::json!({})).await.unwrap(),
            ProposalStatus::Active
        );
        // Third vote reaches 3/5 = quorum; 3/3 approvals resolves it.
        assert_eq!(
            manager.record_vote(id, "p4", true, serde_json::json!({})).await.unwrap(),
            ProposalStatus::Approved
        );

        // Late vote does not reopen.
        assert_eq!(
            manager.record_vote(id, "p5", false, serde_json::json!({})).await.unwrap(),
            ProposalStatus::Approved
        );
        assert_eq!(manager.stats().await.approved, 1);
    }

    #[tokio::test]
    async fn test_quorum_rejection() {
        let all = ["p1", "p2", "p3", "p4", "p5"];
        let (_bus, manager) = harness(&all).await;
        let id = manager
            .propose("p1", "downgrade", serde_json::json!({}), names(&all), None)
            .await
            .unwrap();

        manager.record_vote(id, "p2", false, serde_json::json!({})).await.unwrap();
        manager.record_vote(id, "p3", false, serde_json::json!({})).await.unwrap();
        // Quorum reached with 1/3 approvals: rejected.
        assert_eq!(
            manager.record_vote(id, "p4", true, serde_json::json!({})).await.unwrap(),
            ProposalStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_vote_request_excludes_proposer() {
        let all = ["p1", "p2", "p3"];
        let (bus, manager) = harness(&all).await;
        manager
            .propose("p1", "topic", serde_json::json!({}), names(&all), None)
            .await
            .unwrap();

        assert!(bus.drain("p1", StdDuration::from_millis(10)).await.unwrap().is_empty());
        assert_eq!(bus.drain("p2", StdDuration::from_millis(10)).await.unwrap().len(), 1);
        assert_eq!(bus.drain("p3", StdDuration::from_millis(10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_sweep_notifies_once() {
        let all = ["p1", "p2", "p3"];
        let (bus, manager) = harness(&all).await;
        let id = manager
            .propose("p1", "topic", serde_json::json!({}), names(&all), Some(0))
            .await
            .unwrap();

        // Clear the vote requests.
        for p in &all {
            bus.drain(p, StdDuration::from_millis(10)).await.unwrap();
        }

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        manager.sweep().await.unwrap();
        manager.sweep().await.unwrap();

        assert_eq!(
            manager.get_proposal(id).await.unwrap().status,
            ProposalStatus::Timeout
        );
        for p in &all {
            let inbox = bus.drain(p, StdDuration::from_millis(10)).await.unwrap();
            assert_eq!(inbox.len(), 1, "{} should see exactly one result", p);
        }
        assert_eq!(manager.stats().await.timed_out, 1);
    }

    #[tokio::test]
    async fn test_non_participant_vote_rejected() {
        let all = ["p1", "p2"];
        let (_bus, manager) = harness(&all).await;
        let id = manager
            .propose("p1", "topic", serde_json::json!({}), names(&all), None)
            .await
            .unwrap();

        assert!(manager
            .record_vote(id, "stranger", true, serde_json::json!({}))
            .await
            .is_err());
    }
}
