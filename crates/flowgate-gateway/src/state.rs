use std::sync::Arc;

use flowgate_engine::{ApprovalBroker, ExecutionManager};
use flowgate_store::ToolStreamLog;

use crate::hub::ObserverHub;

/// Shared application state for axum handlers.
pub struct AppState {
    pub manager: ExecutionManager,
    pub broker: Arc<ApprovalBroker>,
    pub tool_stream: Option<Arc<ToolStreamLog>>,
    pub hub: Arc<ObserverHub>,
}
