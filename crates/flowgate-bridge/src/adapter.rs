use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::plan::{NodeKind, PlanNode};
use flowgate_core::traits::{NodeAdapter, NodeContext, NodeOutcome};
use flowgate_core::types::RiskLevel;

use crate::manager::BridgeManager;
use crate::session::{BridgeSession, InvokeOptions};

fn invoke_options(node: &PlanNode, ctx: &NodeContext) -> InvokeOptions {
    InvokeOptions {
        correlation_id: Some(format!("{}:{}:{}", ctx.execution_id, node.id, ctx.attempt)),
        // Low risk is the default, so it carries no signal for the risky-tool hook.
        risk_level: (node.risk_level > RiskLevel::Low).then_some(node.risk_level),
        execution_id: Some(ctx.execution_id.clone()),
        plan_id: Some(ctx.plan_id.clone()),
        node_id: Some(node.id.clone()),
        cancel: Some(ctx.cancel.clone()),
    }
}

/// Invoke through `session`. Cancellation travels in `options`, so the
/// session still closes the call's stream when the node is cancelled.
async fn call(
    session: BridgeSession,
    node_id: String,
    tool: &str,
    arguments: Value,
    options: InvokeOptions,
) -> NodeOutcome {
    match session.invoke_tool(tool, arguments, options).await {
        Ok(value) => NodeOutcome::success(node_id, Some(value)),
        Err(FlowgateError::Cancelled) => NodeOutcome::cancelled(node_id),
        Err(e) => NodeOutcome::failed(node_id, e.to_string()),
    }
}

/// Runs `mcp_tool` nodes against a configured bridge server.
pub struct McpToolAdapter {
    bridges: Arc<BridgeManager>,
}

impl McpToolAdapter {
    pub fn new(bridges: Arc<BridgeManager>) -> Self {
        Self { bridges }
    }
}

impl NodeAdapter for McpToolAdapter {
    fn node_type(&self) -> &str {
        "mcp_tool"
    }

    fn execute(&self, node: &PlanNode, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let node = node.clone();
        Box::pin(async move {
            let NodeKind::McpTool {
                server,
                tool,
                arguments,
            } = &node.kind
            else {
                return Err(FlowgateError::NodeFailed {
                    node: node.id.clone(),
                    message: "not an mcp_tool node".into(),
                });
            };
            let session = match self.bridges.session(server).await {
                Ok(session) => session,
                Err(e) => return Ok(NodeOutcome::failed(node.id.clone(), e.to_string())),
            };
            let options = invoke_options(&node, &ctx);
            Ok(call(session, node.id.clone(), tool, arguments.clone(), options).await)
        })
    }

    fn dry_run(&self, node: &PlanNode) -> BoxFuture<'_, Result<()>> {
        let check = match &node.kind {
            NodeKind::McpTool { server, .. } if !self.bridges.is_configured(server) => {
                Err(FlowgateError::Config(format!(
                    "No bridge server configured: {}",
                    server
                )))
            }
            _ => Ok(()),
        };
        Box::pin(async move { check })
    }
}

/// Runs `agent_invocation` nodes as a tool call named after the agent.
///
/// Without an explicit `server`, the only configured server is used.
pub struct AgentInvocationAdapter {
    bridges: Arc<BridgeManager>,
}

impl AgentInvocationAdapter {
    pub fn new(bridges: Arc<BridgeManager>) -> Self {
        Self { bridges }
    }

    fn resolve_server(&self, node_id: &str, server: Option<&String>) -> Result<String> {
        if let Some(server) = server {
            return Ok(server.clone());
        }
        let names = self.bridges.server_names();
        match names.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(FlowgateError::Config(format!(
                "Node {} needs a bridge server but none are configured",
                node_id
            ))),
            _ => Err(FlowgateError::Config(format!(
                "Node {} must name a server; configured: {}",
                node_id,
                names.join(", ")
            ))),
        }
    }
}

impl NodeAdapter for AgentInvocationAdapter {
    fn node_type(&self) -> &str {
        "agent_invocation"
    }

    fn execute(&self, node: &PlanNode, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let node = node.clone();
        Box::pin(async move {
            let NodeKind::AgentInvocation {
                agent,
                prompt,
                server,
                input,
            } = &node.kind
            else {
                return Err(FlowgateError::NodeFailed {
                    node: node.id.clone(),
                    message: "not an agent_invocation node".into(),
                });
            };
            let server = match self.resolve_server(&node.id, server.as_ref()) {
                Ok(server) => server,
                Err(e) => return Ok(NodeOutcome::failed(node.id.clone(), e.to_string())),
            };
            let session = match self.bridges.session(&server).await {
                Ok(session) => session,
                Err(e) => return Ok(NodeOutcome::failed(node.id.clone(), e.to_string())),
            };

            let mut arguments = json!({"prompt": prompt});
            if let Some(input) = input {
                arguments["input"] = input.clone();
            }
            let options = invoke_options(&node, &ctx);
            Ok(call(session, node.id.clone(), agent, arguments, options).await)
        })
    }

    fn dry_run(&self, node: &PlanNode) -> BoxFuture<'_, Result<()>> {
        let check = match &node.kind {
            NodeKind::AgentInvocation { server, .. } => self
                .resolve_server(&node.id, server.as_ref())
                .and_then(|name| {
                    if self.bridges.is_configured(&name) {
                        Ok(())
                    } else {
                        Err(FlowgateError::Config(format!(
                            "No bridge server configured: {}",
                            name
                        )))
                    }
                }),
            _ => Ok(()),
        };
        Box::pin(async move { check })
    }
}
