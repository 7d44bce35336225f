use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::plan::{PlanNode, StateMap};
use crate::types::NodeStatus;

/// Everything an adapter may read while executing one node attempt.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub execution_id: String,
    pub plan_id: String,
    pub plan_version: String,
    /// Snapshot of shared per-execution state at dispatch time.
    pub state: StateMap,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Adapters should poll this and return early when cancelled.
    pub cancel: CancellationToken,
}

/// What an adapter reports for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutcome {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeOutcome {
    pub fn success(node_id: impl Into<String>, output: Option<serde_json::Value>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Success,
            output,
            error: None,
        }
    }

    pub fn failed(node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Cancelled,
            output: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

/// Pluggable executor for one leaf node `type`.
pub trait NodeAdapter: Send + Sync + 'static {
    /// The node `type` this adapter handles (e.g. "local_task").
    fn node_type(&self) -> &str;

    /// Run one attempt. `Err` is treated the same as a `Failed` outcome.
    fn execute(&self, node: &PlanNode, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>>;

    /// Validate the node without side effects.
    fn dry_run(&self, node: &PlanNode) -> BoxFuture<'_, Result<()>> {
        let _ = node;
        Box::pin(async { Ok(()) })
    }
}
