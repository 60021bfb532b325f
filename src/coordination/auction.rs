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
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub agent: String,
    pub amount: f64,
    pub confidence: f64,
    pub eta_secs: u64,
    pub placed_at: DateTime<Utc>,
}

/// A sealed-bid auction. Exactly one winner, or failure when the window
/// closes with no bids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub id: Uuid,
    pub task: serde_json::Value,
    pub required_capabilities: Vec<String>,
    pub bids: Vec<Bid>,
    pub status: AuctionStatus,
    pub winner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuctionConfig {
    /// Weight of confidence in the score `amount - confidence * weight`.
    pub confidence_weight: f64,
    pub default_window_secs: u64,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            confidence_weight: 10.0,
            default_window_secs: 30,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct AuctionStats {
    pub completed: u64,
    pub failed: u64,
}

/// Sealed-bid work allocation. Announcements are capability-scoped; bids
/// are accepted until the window closes; the winner minimizes
/// `amount - confidence * weight`, ties resolving to the earliest bid.
pub struct AuctionManager {
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    auctions: RwLock<HashMap<Uuid, Auction>>,
    stats: RwLock<AuctionStats>,
    config: AuctionConfig,
}

impl AuctionManager {
    pub fn new(
        bus: Arc<MessageBus>,
        registry: Arc<AgentRegistry>,
        config: AuctionConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            auctions: RwLock::new(HashMap::new()),
            stats: RwLock::new(AuctionStats::default()),
            config,
        }
    }

    /// Open an auction announced to every healthy agent advertising the
    /// required capabilities.
    pub async fn start_auction(
        &self,
        task: serde_json::Value,
        required_capabilities: Vec<String>,
        window_secs: Option<u64>,
    ) -> Result<Uuid> {
        let bidders: Vec<String> = self
            .registry
            .find_capable(&required_capabilities)
            .await
            .into_iter()
            .map(|record| record.agent_id)
            .collect();
        self.open(task, required_capabilities, bidders, window_secs)
            .await
    }

    /// Open an auction announced to an explicit participant set.
    pub async fn start_scoped(
        &self,
        task: serde_json::Value,
        participants: Vec<String>,
        window_secs: Option<u64>,
    ) -> Result<Uuid> {
        self.open(task, Vec::new(), participants, window_secs).await
    }

    async fn open(
        &self,
        task: serde_json::Value,
        required_capabilities: Vec<String>,
        bidders: Vec<String>,
        window_secs: Option<u64>,
    ) -> Result<Uuid> {
        let window = window_secs.unwrap_or(self.config.default_window_secs);
        let auction = Auction {
            id: Uuid::new_v4(),
            task: task.clone(),
            required_capabilities: required_capabilities.clone(),
            bids: Vec::new(),
            status: AuctionStatus::Active,
            winner: None,
            created_at: Utc::now(),
            closes_at: Utc::now() + Duration::seconds(window as i64),
        };
        let auction_id = auction.id;
        let closes_at = auction.closes_at;
        self.auctions.write().await.insert(auction_id, auction);

        for bidder in &bidders {
            let announcement = Message::new(
                "auctioneer",
                bidder,
                MessageContent::Coordination {
                    signal: CoordinationSignal::AuctionAnnouncement {
                        auction_id,
                        task: task.clone(),
                        required_capabilities: required_capabilities.clone(),
                        closes_at,
                    },
                },
            );
            if let Err(e) = self.bus.send(announcement).await {
                warn!("auction announcement to {} failed: {}", bidder, e);
            }
        }

        info!("auction {} opened for {} bidders", auction_id, bidders.len());
        Ok(auction_id)
    }

    /// Record a sealed bid. One bid per agent; later bids from the same
    /// agent are ignored. Bids after the window closes are rejected.
    pub async fn place_bid(
        &self,
        auction_id: Uuid,
        agent: &str,
        amount: f64,
        confidence: f64,
        eta_secs: u64,
    ) -> Result<()> {
        let mut auctions = self.auctions.write().await;
        let auction = auctions.get_mut(&auction_id).ok_or_else(|| {
            Error::CoordError(CoordError::AuctionNotFound(auction_id.to_string()))
        })?;

        if auction.status != AuctionStatus::Active || Utc::now() > auction.closes_at {
            return Err(Error::CoordError(CoordError::InvalidState(format!(
                "auction {} is closed",
                auction_id
            ))));
        }
        if auction.bids.iter().any(|b| b.agent == agent) {
            debug!("duplicate bid from {} on {}", agent, auction_id);
            return Ok(());
        }

        auction.bids.push(Bid {
            agent: agent.to_string(),
            amount,
            confidence,
            eta_secs,
            placed_at: Utc::now(),
        });
        debug!("bid from {} on {}: {}", agent, auction_id, amount);
        Ok(())
    }

    /// Close the auction, select the winner and notify every bidder.
    pub async fn close(&self, auction_id: Uuid) -> Result<AuctionStatus> {
        let auction = {
            let mut auctions = self.auctions.write().await;
            let auction = auctions.get_mut(&auction_id).ok_or_else(|| {
                Error::CoordError(CoordError::AuctionNotFound(auction_id.to_string()))
            })?;
            if auction.status != AuctionStatus::Active {
                return Ok(auction.status);
            }

            if auction.bids.is_empty() {
                auction.status = AuctionStatus::Failed;
            } else {
                let weight = self.config.confidence_weight;
                let winner = auction
                    .bids
                    .iter()
                    .min_by(|a, b| {
                        score(a, weight)
                            .total_cmp(&score(b, weight))
                            .then(a.placed_at.cmp(&b.placed_at))
                    })
                    .cloned();
                auction.winner = winner.map(|b| b.agent);
                auction.status = AuctionStatus::Completed;
            }
            auction.clone()
        };

        {
            let mut stats = self.stats.write().await;
            match auction.status {
                AuctionStatus::Completed => stats.completed += 1,
                AuctionStatus::Failed => stats.failed += 1,
                AuctionStatus::Active => {}
            }
        }

        match &auction.winner {
            Some(winner) => {
                let winning_amount = auction
                    .bids
                    .iter()
                    .find(|b| &b.agent == winner)
                    .map(|b| b.amount);
                self.notify_outcome(&auction, winner, winning_amount).await;
                info!("auction {} won by {}", auction.id, winner);
            }
            None => {
                warn!("auction {} failed: no bids", auction.id);
            }
        }

        Ok(auction.status)
    }

    pub async fn get_auction(&self, auction_id: Uuid) -> Option<Auction> {
        self.auctions.read().await.get(&auction_id).cloned()
    }

    pub async fn stats(&self) -> AuctionStats {
        self.stats.read().await.clone()
    }

    /// Close auctions whose window has elapsed.
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .auctions
            .read()
            .await
            .values()
            .filter(|a| a.status == AuctionStatus::Active && now > a.closes_at)
            .map(|a| a.id)
            .collect();

        for auction_id in due {
            if let Err(e) = self.close(auction_id).await {
                warn!("closing auction {} failed: {}", auction_id, e);
            }
        }
        Ok(())
    }

    /// The winner is offered the task; losers are told the winning amount.
    async fn notify_outcome(
        &self,
        auction: &Auction,
        winner: &str,
        winning_amount: Option<f64>,
    ) {
        let offer = Message::new(
            "auctioneer",
            winner,
            MessageContent::TaskRequest {
                task_id: auction.id.to_string(),
                task_type: "auction_award".into(),
                payload: auction.task.clone(),
                shard: None,
            },
        );
        if let Err(e) = self.bus.send(offer).await {
            warn!("task offer to auction winner {} failed: {}", winner, e);
        }

        for bid in &auction.bids {
            let won = bid.agent == winner;
            let result = Message::new(
                "auctioneer",
                &bid.agent,
                MessageContent::Coordination {
                    signal: CoordinationSignal::AuctionResult {
                        auction_id: auction.id,
                        won,
                        winning_amount,
                    },
                },
            );
            if let Err(e) = self.bus.send(result).await {
                debug!("auction result to {} failed: {}", bid.agent, e);
            }
        }
    }
}

fn score(bid: &Bid, weight: f64) -> f64 {
    bid.amount - bid.confidence * weight
}
