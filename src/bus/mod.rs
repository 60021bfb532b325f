pub mod circuit_breaker;
pub mod enhanced;
pub mod message;
pub mod message_bus;

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use enhanced::{
    BusIntrospection, DeliveryMetrics, DeliveryStatus, EnhancedBusConfig, EnhancedMessage,
    EnhancedMessageBus,
};
pub use message::{
    AlertSeverity, CoordinationSignal, LifecycleEvent, Message, MessageContent, MessageFilter,
    Shard,
};
pub use message_bus::{MessageBus, MessageBusConfig, MessageBusStats, PendingResponse};
