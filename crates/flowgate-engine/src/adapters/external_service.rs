use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Method, Url};
use serde_json::{json, Value};
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::plan::{NodeKind, PlanNode};
use flowgate_core::traits::{NodeAdapter, NodeContext, NodeOutcome};

use super::truncate;

/// Runs `external_service` nodes as a single HTTP request.
///
/// Output is `{status, body}` where `body` is parsed JSON when the response
/// is JSON and a string otherwise. Non-2xx responses fail the attempt.
pub struct ExternalServiceAdapter {
    client: reqwest::Client,
}

impl ExternalServiceAdapter {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("flowgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ExternalServiceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_target(node_id: &str, url: &str, method: &str) -> Result<(Url, Method)> {
    let url = Url::parse(url).map_err(|e| FlowgateError::NodeFailed {
        node: node_id.to_string(),
        message: format!("invalid url '{}': {}", url, e),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FlowgateError::NodeFailed {
            node: node_id.to_string(),
            message: format!("unsupported url scheme: {}", url.scheme()),
        });
    }
    let method = Method::from_bytes(method.to_uppercase().as_bytes()).map_err(|_| {
        FlowgateError::NodeFailed {
            node: node_id.to_string(),
            message: format!("invalid http method: {}", method),
        }
    })?;
    Ok((url, method))
}

impl NodeAdapter for ExternalServiceAdapter {
    fn node_type(&self) -> &str {
        "external_service"
    }

    fn execute(&self, node: &PlanNode, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let node_id = node.id.clone();
        let kind = node.kind.clone();
        Box::pin(async move {
            let NodeKind::ExternalService {
                url,
                method,
                headers,
                body,
            } = kind
            else {
                return Err(FlowgateError::NodeFailed {
                    node: node_id,
                    message: "not an external_service node".into(),
                });
            };
            let (url, method) = parse_target(&node_id, &url, &method)?;

            debug!(node_id = %node_id, method = %method, url = %url, attempt = ctx.attempt, "Calling external service");

            let mut request = self
                .client
                .request(method, url)
                .header("x-flowgate-execution-id", &ctx.execution_id);
            for (name, value) in &headers {
                request = request.header(name, value);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let send = request.send();
            let response = tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(NodeOutcome::cancelled(node_id)),
                response = send => response.map_err(|e| FlowgateError::NodeFailed {
                    node: node_id.clone(),
                    message: format!("request failed: {}", e),
                })?,
            };

            let status = response.status();
            let is_json = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.contains("json"));
            let text = response.text().await.map_err(|e| FlowgateError::NodeFailed {
                node: node_id.clone(),
                message: format!("failed to read response body: {}", e),
            })?;

            let body = if is_json {
                serde_json::from_str(&text).unwrap_or(Value::String(truncate(text)))
            } else {
                Value::String(truncate(text))
            };
            let output = json!({"status": status.as_u16(), "body": body});

            if status.is_success() {
                Ok(NodeOutcome::success(node_id, Some(output)))
            } else {
                let mut outcome = NodeOutcome::failed(
                    node_id,
                    format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown")
                    ),
                );
                outcome.output = Some(output);
                Ok(outcome)
            }
        })
    }

    fn dry_run(&self, node: &PlanNode) -> BoxFuture<'_, Result<()>> {
        let check = match &node.kind {
            NodeKind::ExternalService { url, method, .. } => {
                parse_target(&node.id, url, method).map(|_| ())
            }
            _ => Ok(()),
        };
        Box::pin(async move { check })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::types::NodeStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> NodeContext {
        NodeContext {
            execution_id: "exec-9".into(),
            plan_id: "p".into(),
            plan_version: "1".into(),
            state: Default::default(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Serve exactly one canned HTTP response and hand back the raw request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{}/hook", addr), handle)
    }

    fn node(url: &str, method: &str) -> PlanNode {
        serde_json::from_value(json!({
            "id": "notify", "type": "external_service",
            "url": url, "method": method,
            "headers": {"x-team": "ops"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn success_parses_json_body() {
        let (url, server) = serve_once("200 OK", r#"{"accepted":true}"#).await;
        let outcome = ExternalServiceAdapter::new()
            .execute(&node(&url, "post"), ctx())
            .await
            .unwrap();
        assert!(outcome.is_success());
        let out = outcome.output.unwrap();
        assert_eq!(out["status"], 200);
        assert_eq!(out["body"]["accepted"], true);

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /hook"));
        assert!(request.contains("x-team: ops"));
        assert!(request.contains("x-flowgate-execution-id: exec-9"));
    }

    #[tokio::test]
    async fn non_2xx_fails() {
        let (url, _server) = serve_once("503 Service Unavailable", r#"{"retry":true}"#).await;
        let outcome = ExternalServiceAdapter::new()
            .execute(&node(&url, "GET"), ctx())
            .await
            .unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("HTTP 503 Service Unavailable"));
        assert_eq!(outcome.output.unwrap()["status"], 503);
    }

    #[tokio::test]
    async fn dry_run_validates_url_and_method() {
        let adapter = ExternalServiceAdapter::new();
        assert!(adapter.dry_run(&node("https://example.com/x", "PUT")).await.is_ok());
        assert!(adapter.dry_run(&node("not a url", "GET")).await.is_err());
        assert!(adapter.dry_run(&node("ftp://example.com", "GET")).await.is_err());
        assert!(adapter.dry_run(&node("https://example.com", "BAD METHOD")).await.is_err());
    }
}
