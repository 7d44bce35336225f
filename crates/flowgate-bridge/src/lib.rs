//! Bridge sessions: resumable, self-healing connections to remote tool
//! endpoints, plus the node adapters that call through them.

pub mod adapter;
pub mod backoff;
pub mod handler;
pub mod hooks;
pub mod manager;
pub mod mcp;
pub mod registry;
pub mod session;
pub mod transport;

pub use adapter::{AgentInvocationAdapter, McpToolAdapter};
pub use backoff::ReconnectPolicy;
pub use hooks::{BridgeHooks, ToolInvocation};
pub use manager::BridgeManager;
pub use mcp::McpTransportFactory;
pub use registry::SessionRegistry;
pub use session::{BridgeContext, BridgeSession, InvokeOptions, SessionOptions, SessionState};
pub use transport::{
    BridgeTransport, Connection, ConnectRequest, ResumeToken, ToolDescriptor, TransportEvent,
    TransportFactory,
};
