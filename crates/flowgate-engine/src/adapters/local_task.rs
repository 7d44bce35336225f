use std::process::Stdio;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::plan::{NodeKind, PlanNode};
use flowgate_core::traits::{NodeAdapter, NodeContext, NodeOutcome};

use super::truncate;

/// Runs `local_task` nodes as `sh -c <command>`.
///
/// Output is `{stdout, stderr, exitCode}`; a non-zero exit fails the attempt.
pub struct LocalTaskAdapter;

impl NodeAdapter for LocalTaskAdapter {
    fn node_type(&self) -> &str {
        "local_task"
    }

    fn execute(&self, node: &PlanNode, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let node_id = node.id.clone();
        let kind = node.kind.clone();
        Box::pin(async move {
            let NodeKind::LocalTask {
                command,
                working_dir,
                env,
            } = kind
            else {
                return Err(FlowgateError::NodeFailed {
                    node: node_id,
                    message: "not a local_task node".into(),
                });
            };

            debug!(node_id = %node_id, command = %command, attempt = ctx.attempt, "Running local task");

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(&command)
                .envs(&env)
                .env("FLOWGATE_EXECUTION_ID", &ctx.execution_id)
                .env("FLOWGATE_PLAN_ID", &ctx.plan_id)
                .env("FLOWGATE_NODE_ID", &node_id)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &working_dir {
                cmd.current_dir(dir);
            }

            let child = cmd.spawn().map_err(|e| FlowgateError::NodeFailed {
                node: node_id.clone(),
                message: format!("failed to spawn command: {}", e),
            })?;

            // Dropping the wait future kills the child.
            let output = tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(NodeOutcome::cancelled(node_id)),
                output = child.wait_with_output() => output?,
            };

            let stdout = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
            let stderr = truncate(String::from_utf8_lossy(&output.stderr).into_owned());
            let code = output.status.code().unwrap_or(-1);
            let result = json!({
                "stdout": stdout,
                "stderr": stderr,
                "exitCode": code,
            });

            if output.status.success() {
                Ok(NodeOutcome::success(node_id, Some(result)))
            } else {
                let detail = if stderr.trim().is_empty() {
                    String::new()
                } else {
                    format!(": {}", stderr.trim())
                };
                let mut outcome = NodeOutcome::failed(node_id, format!("exit code {}{}", code, detail));
                outcome.output = Some(result);
                Ok(outcome)
            }
        })
    }

    fn dry_run(&self, node: &PlanNode) -> BoxFuture<'_, Result<()>> {
        let check = match &node.kind {
            NodeKind::LocalTask { command, .. } if command.trim().is_empty() => {
                Err(FlowgateError::NodeFailed {
                    node: node.id.clone(),
                    message: "command is empty".into(),
                })
            }
            NodeKind::LocalTask { working_dir: Some(dir), .. }
                if !std::path::Path::new(dir).is_dir() =>
            {
                Err(FlowgateError::NodeFailed {
                    node: node.id.clone(),
                    message: format!("working directory does not exist: {}", dir),
                })
            }
            _ => Ok(()),
        };
        Box::pin(async move { check })
    }
}
