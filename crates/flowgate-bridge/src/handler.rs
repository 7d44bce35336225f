use std::future::Future;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rmcp::handler::client::ClientHandler;
use rmcp::model::*;
use rmcp::service::{NotificationContext, RequestContext};
use rmcp::ErrorData as McpError;
use rmcp::RoleClient;

use crate::transport::TransportEvent;

/// Relays MCP server notifications into the session's event stream.
pub struct FlowgateClientHandler {
    server_name: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl FlowgateClientHandler {
    pub fn new(server_name: &str, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            server_name: server_name.to_string(),
            events,
        }
    }

    fn relay(&self, payload: serde_json::Value) {
        // Receiver gone means the session already moved on.
        let _ = self.events.send(TransportEvent::Message {
            event_id: None,
            payload,
        });
    }
}

#[allow(clippy::manual_async_fn)]
impl ClientHandler for FlowgateClientHandler {
    fn on_tool_list_changed(
        &self,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async {
            debug!(server = %self.server_name, "MCP tools/list_changed notification");
            self.relay(json!({"kind": "tools_changed"}));
        }
    }

    fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            debug!(server = %self.server_name, uri = %params.uri, "MCP resource updated");
            self.relay(json!({"kind": "resource_updated", "uri": params.uri.to_string()}));
        }
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let level = format!("{:?}", params.level).to_lowercase();
            debug!(server = %self.server_name, level = %level, "MCP log: {}", params.data);
            self.relay(json!({"kind": "log", "level": level, "data": params.data}));
        }
    }

    fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            self.relay(json!({
                "kind": "progress",
                "progress": params.progress,
                "total": params.total,
                "message": params.message,
            }));
        }
    }

    fn create_message(
        &self,
        _params: CreateMessageRequestParams,
        _ctx: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<CreateMessageResult, McpError>> + Send + '_ {
        async {
            warn!(server = %self.server_name, "Server requested sampling, which flowgate does not provide");
            Err(McpError::method_not_found::<CreateMessageRequestMethod>())
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "flowgate".into(),
                title: None,
                version: env!("CARGO_PKG_VERSION").into(),
                description: None,
                icons: None,
                website_url: None,
            },
        }
    }
}
