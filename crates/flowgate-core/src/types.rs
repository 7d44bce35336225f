use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Risk classification carried by every plan node.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// Lifecycle of one execution: `pending -> running -> {success, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Snapshot of one execution, owned by the engine for its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_id: Option<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new().0,
            plan_id: plan_id.into(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            last_node_id: None,
            outputs: BTreeMap::new(),
            error: None,
        }
    }

    /// Move to a terminal status, stamping `finishedAt`.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.error = error;
    }
}

/// Plan-level concurrency policy (`schedule.concurrency`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    #[default]
    Allow,
    Forbid,
    Queue,
}

/// Status of a single node after it settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---- Approvals ----

/// An approval waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalEntry {
    pub id: String,
    pub plan_id: String,
    pub plan_version: String,
    pub node_id: String,
    pub node_type: String,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

/// A decision submitted for a pending approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub status: ApprovalStatus,
    pub decided_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalDecision {
    pub fn approved(by: impl Into<String>) -> Self {
        Self {
            status: ApprovalStatus::Approved,
            decided_by: by.into(),
            comment: None,
        }
    }

    pub fn rejected(by: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            status: ApprovalStatus::Rejected,
            decided_by: by.into(),
            comment: Some(comment.into()),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A decided approval. Supersedes its pending counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedApprovalEntry {
    #[serde(flatten)]
    pub request: PendingApprovalEntry,
    pub status: ApprovalStatus,
    pub decided_at: DateTime<Utc>,
    pub decided_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl CompletedApprovalEntry {
    pub fn from_pending(request: PendingApprovalEntry, decision: ApprovalDecision) -> Self {
        Self {
            request,
            status: decision.status,
            decided_at: Utc::now(),
            decided_by: decision.decided_by,
            comment: decision.comment,
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }
}

// ---- Bridge ----

/// Persisted resume state for one `(serverName, userId)` bridge session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSessionRecord {
    pub server_name: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

// ---- Tool stream ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Start,
    Success,
    Error,
}

/// One tool-activity record. `sequence` and `storedAt` are assigned by the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStreamChunk {
    pub correlation_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub status: ChunkStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<DateTime<Utc>>,
}

impl ToolStreamChunk {
    pub fn new(
        correlation_id: impl Into<String>,
        tool_name: impl Into<String>,
        status: ChunkStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            tool_name: tool_name.into(),
            execution_id: None,
            plan_id: None,
            node_id: None,
            status,
            message: message.into(),
            timestamp: Utc::now(),
            sequence: 0,
            stored_at: None,
        }
    }
}

/// Derived aggregate over all chunks of one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStreamSummaryPayload {
    pub correlation_id: String,
    pub tool_name: String,
    pub chunk_count: u64,
    pub latest_sequence: u64,
    pub updated_at: DateTime<Utc>,
    pub completed: bool,
    pub has_error: bool,
}

impl ToolStreamSummaryPayload {
    pub fn from_chunk(chunk: &ToolStreamChunk) -> Self {
        let mut summary = Self {
            correlation_id: chunk.correlation_id.clone(),
            tool_name: chunk.tool_name.clone(),
            chunk_count: 0,
            latest_sequence: 0,
            updated_at: chunk.timestamp,
            completed: false,
            has_error: false,
        };
        summary.absorb(chunk);
        summary
    }

    /// Fold one more chunk into the summary.
    pub fn absorb(&mut self, chunk: &ToolStreamChunk) {
        self.chunk_count += 1;
        if chunk.sequence >= self.latest_sequence {
            self.latest_sequence = chunk.sequence;
            self.updated_at = chunk.stored_at.unwrap_or(chunk.timestamp);
        }
        match chunk.status {
            ChunkStatus::Start => {}
            ChunkStatus::Success => self.completed = true,
            ChunkStatus::Error => {
                self.completed = true;
                self.has_error = true;
            }
        }
    }
}

// ---- Event payloads ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatePayload {
    pub running: usize,
    pub pending: usize,
    #[serde(default)]
    pub dropped_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEventPayload {
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEventPayload {
    pub server_name: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
}

impl BridgeEventPayload {
    pub fn new(server_name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            state: state.into(),
            attempt: None,
            delay_ms: None,
            error: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLinePayload {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNoticePayload {
    pub message: String,
}
