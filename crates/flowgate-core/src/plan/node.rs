use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{ConcurrencyPolicy, RiskLevel};

/// A declarative plan: a DAG of typed work nodes with an entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    #[serde(default = "default_version", deserialize_with = "string_or_number")]
    pub version: String,
    pub entry: String,
    pub nodes: Vec<PlanNode>,
    #[serde(default)]
    pub schedule: Schedule,
}

fn default_version() -> String {
    "1".to_string()
}

/// Accept `"version": 3` as well as `"version": "3"`.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "version must be a string or number, got {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// None defers to the runtime default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyPolicy>,
}

/// Author-declared retry policy: fixed delay, bounded attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_seconds: f64,
}

/// One node of a plan. Fields common to every kind live here; the
/// kind-specific payload is the flattened `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub id: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopMode {
    #[serde(rename = "while")]
    While,
    #[serde(rename = "for-each")]
    ForEach,
}

/// Closed set of node kinds, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum NodeKind {
    Sequence {
        children: Vec<String>,
    },
    Parallel {
        children: Vec<String>,
    },
    Conditional {
        expression: String,
        when_true: Vec<String>,
        #[serde(default)]
        when_false: Vec<String>,
    },
    Loop {
        body: Vec<String>,
        mode: LoopMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
        max_iterations: u32,
    },
    HumanApproval {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    LocalTask {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    AgentInvocation {
        agent: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
    },
    McpTool {
        server: String,
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    ExternalService {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl NodeKind {
    /// The `type` tag as written in plan documents; also the adapter key.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Sequence { .. } => "sequence",
            Self::Parallel { .. } => "parallel",
            Self::Conditional { .. } => "conditional",
            Self::Loop { .. } => "loop",
            Self::HumanApproval { .. } => "human_approval",
            Self::LocalTask { .. } => "local_task",
            Self::AgentInvocation { .. } => "agent_invocation",
            Self::McpTool { .. } => "mcp_tool",
            Self::ExternalService { .. } => "external_service",
        }
    }

    /// Child ids regardless of kind. Leaf kinds yield an empty list.
    pub fn child_ids(&self) -> Vec<String> {
        match self {
            Self::Sequence { children } | Self::Parallel { children } => children.clone(),
            Self::Conditional {
                when_true,
                when_false,
                ..
            } => {
                let mut ids = when_true.clone();
                for id in when_false {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
                ids
            }
            Self::Loop { body, .. } => body.clone(),
            Self::HumanApproval { .. }
            | Self::LocalTask { .. }
            | Self::AgentInvocation { .. }
            | Self::McpTool { .. }
            | Self::ExternalService { .. } => Vec::new(),
        }
    }

    /// Leaf action kinds are dispatched to adapters.
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            Self::LocalTask { .. }
                | Self::AgentInvocation { .. }
                | Self::McpTool { .. }
                | Self::ExternalService { .. }
        )
    }
}

impl PlanNode {
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_kind_parses_from_type_tag() {
        let node: PlanNode = serde_json::from_value(json!({
            "id": "fetch",
            "type": "mcp_tool",
            "riskLevel": "medium",
            "server": "search",
            "tool": "web_search",
            "arguments": {"q": "rust"},
            "retryPolicy": {"maxAttempts": 3, "backoffSeconds": 1},
            "position": {"x": 10, "y": 20}
        }))
        .unwrap();

        assert_eq!(node.type_name(), "mcp_tool");
        assert_eq!(node.risk_level, RiskLevel::Medium);
        assert_eq!(node.retry_policy.as_ref().unwrap().max_attempts, 3);
        assert!(node.kind.is_action());
        assert!(node.kind.child_ids().is_empty());
    }

    #[test]
    fn conditional_children_are_union_of_branches() {
        let kind = NodeKind::Conditional {
            expression: "true".into(),
            when_true: vec!["a".into(), "b".into()],
            when_false: vec!["b".into(), "c".into()],
        };
        assert_eq!(kind.child_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn loop_mode_uses_hyphenated_name() {
        let node: PlanNode = serde_json::from_value(json!({
            "id": "each",
            "type": "loop",
            "mode": "for-each",
            "collection": "list.output",
            "body": ["work"],
            "maxIterations": 10
        }))
        .unwrap();
        match node.kind {
            NodeKind::Loop { mode, max_iterations, .. } => {
                assert_eq!(mode, LoopMode::ForEach);
                assert_eq!(max_iterations, 10);
            }
            other => panic!("expected loop, got {:?}", other),
        }
    }

    #[test]
    fn numeric_version_is_accepted() {
        let plan: Plan = serde_json::from_value(json!({
            "id": "p",
            "version": 2,
            "entry": "a",
            "nodes": [{"id": "a", "type": "local_task", "command": "true"}]
        }))
        .unwrap();
        assert_eq!(plan.version, "2");
        assert_eq!(plan.schedule.concurrency, None);
    }
}
