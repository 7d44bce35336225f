use thiserror::Error;

/// Reasons a plan document is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("plan schema: {0}")]
    Schema(String),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("entry node '{0}' does not exist")]
    MissingEntry(String),

    #[error("node '{parent}' references unknown child '{child}'")]
    UnresolvedChild { parent: String, child: String },

    #[error("cycle detected through node '{0}'")]
    Cycle(String),

    #[error("expression for node '{node}': {message}")]
    Expression { node: String, message: String },

    #[error("node '{node}': {message}")]
    InvalidNode { node: String, message: String },

    #[error("edge {source_id} -> {target}: {message}")]
    InvalidEdge {
        source_id: String,
        target: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum FlowgateError {
    // Plan errors
    #[error("Invalid plan: {0}")]
    PlanValidation(#[from] ValidationError),

    // Event errors
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid payload for event {event}: {message}")]
    InvalidPayload { event: String, message: String },

    // Execution errors
    #[error("No adapter registered for node type: {0}")]
    AdapterNotFound(String),

    #[error("Node failed: {node}: {message}")]
    NodeFailed { node: String, message: String },

    #[error("Node timeout after {timeout_secs}s: {node}")]
    NodeTimeout { node: String, timeout_secs: u64 },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Approval errors
    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Approval already decided: {0}")]
    ApprovalAlreadyDecided(String),

    #[error("Approval rejected for node {node}: {reason}")]
    ApprovalRejected { node: String, reason: String },

    #[error("Approval timeout for node: {node}")]
    ApprovalTimeout { node: String },

    // Bridge errors
    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("Bridge call vetoed for tool {tool}: {reason}")]
    BridgeVetoed { tool: String, reason: String },

    #[error("Bridge unavailable: {server}")]
    BridgeUnavailable { server: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowgateError>;
