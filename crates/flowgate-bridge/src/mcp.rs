use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};

use flowgate_core::config::{BridgeConfig, BridgeTransportConfig};
use flowgate_core::error::{FlowgateError, Result};

use crate::handler::FlowgateClientHandler;
use crate::transport::{
    BridgeTransport, Connection, ConnectRequest, ToolDescriptor, TransportEvent, TransportFactory,
};

type McpConnection = RunningService<RoleClient, FlowgateClientHandler>;

/// How often a live MCP connection is checked for closure.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Opens MCP client connections (stdio child process or streamable HTTP).
#[derive(Default)]
pub struct McpTransportFactory {
    servers: HashMap<String, BridgeTransportConfig>,
}

impl McpTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            servers: config
                .servers
                .iter()
                .map(|(name, server)| (name.clone(), server.transport.clone()))
                .collect(),
        }
    }

    pub fn insert(&mut self, server_name: impl Into<String>, transport: BridgeTransportConfig) {
        self.servers.insert(server_name.into(), transport);
    }
}

async fn open(name: &str, config: &BridgeTransportConfig, handler: FlowgateClientHandler) -> Result<McpConnection> {
    match config {
        BridgeTransportConfig::Stdio { command, args, env } => {
            let mut cmd = tokio::process::Command::new(command);
            cmd.args(args);
            for (k, v) in env {
                cmd.env(k, v);
            }
            let transport = rmcp::transport::TokioChildProcess::new(cmd)
                .map_err(|e| FlowgateError::Bridge(format!("Failed to spawn {}: {}", command, e)))?;
            handler.serve(transport).await.map_err(|e| {
                FlowgateError::Bridge(format!("Failed to initialize MCP client for {}: {}", name, e))
            })
        }
        BridgeTransportConfig::Http { url } => {
            let transport = StreamableHttpClientTransport::from_uri(url.as_str());
            <FlowgateClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
                .await
                .map_err(|e| FlowgateError::Bridge(format!("MCP init for '{}' failed: {}", name, e)))
        }
    }
}

impl TransportFactory for McpTransportFactory {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            let name = request.server_name;
            let config = self.servers.get(&name).ok_or_else(|| {
                FlowgateError::Config(format!("No bridge server configured: {}", name))
            })?;

            let (tx, rx) = mpsc::unbounded_channel();
            let client = open(&name, config, FlowgateClientHandler::new(&name, tx.clone())).await?;

            // MCP has no server-side resume; the logical session id carries over.
            let session_id = request
                .resume
                .map(|r| r.session_id)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            info!(server = %name, session_id = %session_id, "MCP server connected");
            let transport = McpTransport::start(name, client, tx);
            Ok(Connection {
                transport: Box::new(transport),
                session_id,
                events: rx,
            })
        })
    }
}

/// One live MCP client connection.
pub struct McpTransport {
    server_name: String,
    client: Arc<Mutex<Option<McpConnection>>>,
    stop: CancellationToken,
}

impl McpTransport {
    fn start(server_name: String, client: McpConnection, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let client = Arc::new(Mutex::new(Some(client)));
        let stop = CancellationToken::new();

        let watched = client.clone();
        let token = stop.clone();
        let name = server_name.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIVENESS_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let closed = watched.lock().await.as_ref().map_or(true, |c| c.is_closed());
                if closed {
                    debug!(server = %name, "MCP transport closed");
                    let _ = events.send(TransportEvent::Closed {
                        error: Some("MCP transport closed".into()),
                    });
                    return;
                }
            }
        });

        Self {
            server_name,
            client,
            stop,
        }
    }

    fn not_connected(&self) -> FlowgateError {
        FlowgateError::Bridge(format!("Server '{}' not connected", self.server_name))
    }

    /// A request handle for the live connection. The lock is released before
    /// any request goes out, so calls on one server run concurrently.
    async fn peer(&self) -> Result<Peer<RoleClient>> {
        let guard = self.client.lock().await;
        guard
            .as_ref()
            .map(|client| client.peer().clone())
            .ok_or_else(|| self.not_connected())
    }
}

impl Drop for McpTransport {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl BridgeTransport for McpTransport {
    fn call_tool(&self, tool_name: &str, arguments: Value) -> BoxFuture<'_, Result<Value>> {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let arguments = match arguments {
                Value::Object(map) => Some(map),
                Value::Null => None,
                other => {
                    return Err(FlowgateError::Bridge(format!(
                        "Tool arguments must be a JSON object, got {}",
                        other
                    )))
                }
            };

            let client = self.peer().await?;
            let params = CallToolRequestParams {
                name: tool_name.clone().into(),
                arguments,
                meta: None,
                task: None,
            };
            let result = client.call_tool(params).await.map_err(|e| {
                FlowgateError::Bridge(format!(
                    "Tool call '{}.{}' failed: {}",
                    self.server_name, tool_name, e
                ))
            })?;

            let text: Vec<String> = result
                .content
                .iter()
                .map(|c| match c.raw {
                    RawContent::Text(ref t) => t.text.to_string(),
                    _ => format!("{:?}", c.raw),
                })
                .collect();
            let text = text.join("\n");

            if result.is_error.unwrap_or(false) {
                return Err(FlowgateError::Bridge(format!("{} reported an error: {}", tool_name, text)));
            }
            Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
        })
    }

    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDescriptor>>> {
        Box::pin(async move {
            let client = self.peer().await?;
            let tools = client.list_all_tools().await.map_err(|e| {
                FlowgateError::Bridge(format!(
                    "Failed to list tools from '{}': {}",
                    self.server_name, e
                ))
            })?;
            debug!(server = %self.server_name, count = tools.len(), "Listed MCP tools");

            Ok(tools
                .into_iter()
                .map(|t| ToolDescriptor {
                    name: t.name.to_string(),
                    description: t.description.as_deref().map(str::to_string),
                    input_schema: Value::Object(t.input_schema.as_ref().clone()),
                })
                .collect())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stop.cancel();
            if let Some(mut client) = self.client.lock().await.take() {
                let _ = client.close().await;
                info!(server = %self.server_name, "MCP server disconnected");
            }
        })
    }
}
