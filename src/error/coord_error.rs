#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("mailbox full for agent: {0}")]
    MailboxFull(String),

    #[error("circuit open for agent: {0}")]
    CircuitOpen(String),

    #[error("no capable agent for capabilities: {0}")]
    NoCapableAgent(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("auction not found: {0}")]
    AuctionNotFound(String),

    #[error("message delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("workflow step failed: {0}")]
    StepFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("process error: {0}")]
    ProcessError(String),

    #[error("restart cooldown active for agent: {0}")]
    RestartCooldown(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
