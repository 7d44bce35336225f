use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use flowgate_core::error::Result;

/// Resume hint handed to a transport on (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    pub session_id: String,
    pub last_event_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub server_name: String,
    pub user_id: String,
    pub resume: Option<ResumeToken>,
}

/// Remote tool catalogue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Server-initiated traffic reported by a live transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A server event. `event_id`, when present, is remembered for resume.
    Message {
        event_id: Option<String>,
        payload: Value,
    },
    /// The connection dropped.
    Closed { error: Option<String> },
}

/// A live connection: request/response plus a stream of server events.
pub struct Connection {
    pub transport: Box<dyn BridgeTransport>,
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Request/response half of a connection.
pub trait BridgeTransport: Send + Sync + 'static {
    fn call_tool(&self, tool_name: &str, arguments: Value) -> BoxFuture<'_, Result<Value>>;

    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDescriptor>>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Opens connections. How bytes move is entirely up to the implementation.
pub trait TransportFactory: Send + Sync + 'static {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'_, Result<Connection>>;
}
