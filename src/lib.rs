//! Coordination and messaging substrate for populations of autonomous
//! agent processes.
//!
//! Provides:
//! - Bounded-mailbox message bus with topic pub/sub and request/response
//!   correlation
//! - Routed bus layer with circuit breakers, delivery lifecycle and an
//!   optional durable log
//! - Coordination patterns: sequential, parallel, pipeline,
//!   scatter-gather, consensus voting, sealed-bid auctions
//! - Capability-indexed agent registry with heartbeat health tracking
//! - Per-agent and system resource monitoring with limits and alerts
//! - Controller composing task queuing, process supervision and routing

pub mod bus;
pub mod controller;
pub mod coordination;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod shared;
pub mod store;
pub mod types;

pub use bus::{
    BreakerState, DeliveryStatus, EnhancedMessage, EnhancedMessageBus, Message, MessageBus,
    MessageBusConfig, MessageContent,
};
pub use controller::{AgentSpec, AgentTask, Controller, TokioProcessLauncher};
pub use coordination::{CoordinationManager, CoordinationPattern, CoordinationState};
pub use error::{Error, Result};
pub use monitor::{ProcSampler, ResourceMonitor, ResourceSampler};
pub use registry::{AgentRecord, AgentRegistry};
pub use shared::{Scheduler, SystemConfig, SystemContext};
pub use store::MessageStore;
pub use types::{AgentState, Priority, ResourceVector, RoutingStrategy};
