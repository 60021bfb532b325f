pub mod auction;
pub mod consensus;
pub mod manager;

pub use auction::{Auction, AuctionConfig, AuctionManager, AuctionStats, AuctionStatus, Bid};
pub use consensus::{
    ConsensusConfig, ConsensusManager, ConsensusProposal, ConsensusStats, ProposalStatus,
    VoteRecord,
};
pub use manager::{
    CoordinationConfig, CoordinationManager, CoordinationPattern, CoordinationState,
    CoordinationStats, CoordinationTask,
};
