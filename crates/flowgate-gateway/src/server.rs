use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use flowgate_core::config::GatewayConfig;
use flowgate_core::event::EventBus;
use flowgate_core::types::SystemNoticePayload;
use flowgate_engine::{ApprovalBroker, ExecutionManager};
use flowgate_store::ToolStreamLog;

use crate::hub::ObserverHub;
use crate::routes;
use crate::state::AppState;

/// How often `runtime:state` is published while serving.
const RUNTIME_STATE_INTERVAL: Duration = Duration::from_secs(5);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(routes::ws_handler))
        // REST API
        .route("/api/health", get(routes::health))
        .route(
            "/api/executions",
            get(routes::list_executions).post(routes::start_execution),
        )
        .route("/api/executions/{id}", get(routes::get_execution))
        .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
        .route("/api/approvals", get(routes::list_approvals))
        .route("/api/approvals/{id}", post(routes::decide_approval))
        .route("/api/tool-stream/{correlation}", get(routes::export_tool_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP + WebSocket gateway built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    event_bus: Arc<EventBus>,
    hub: Arc<ObserverHub>,
    manager: ExecutionManager,
    broker: Arc<ApprovalBroker>,
    tool_stream: Option<Arc<ToolStreamLog>>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        event_bus: Arc<EventBus>,
        hub: Arc<ObserverHub>,
        manager: ExecutionManager,
        broker: Arc<ApprovalBroker>,
        tool_stream: Option<Arc<ToolStreamLog>>,
    ) -> Self {
        Self {
            config,
            event_bus,
            hub,
            manager,
            broker,
            tool_stream,
        }
    }

    /// Serve until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            manager: self.manager.clone(),
            broker: self.broker.clone(),
            tool_stream: self.tool_stream.clone(),
            hub: self.hub.clone(),
        });

        let relay = self.hub.spawn_relay(&self.event_bus, shutdown.clone());
        let heartbeat = self.hub.spawn_heartbeat(shutdown.clone());
        let reporter = self.spawn_runtime_state(shutdown.clone());

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");
        self.event_bus.emit(
            "system:notice",
            &SystemNoticePayload {
                message: format!("gateway listening on {}", self.config.bind),
            },
        );

        let serve_shutdown = shutdown.clone();
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await?;

        self.event_bus.emit(
            "system:notice",
            &SystemNoticePayload {
                message: "gateway shutting down".into(),
            },
        );
        shutdown.cancel();
        let _ = tokio::join!(relay, heartbeat, reporter);
        info!("Gateway shut down");
        Ok(())
    }

    fn spawn_runtime_state(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let hub = self.hub.clone();
        let bus = self.event_bus.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RUNTIME_STATE_INTERVAL);
            let mut last = None;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let mut state = manager.runtime_state();
                state.dropped_messages = hub.dropped_messages();
                if last.as_ref() != Some(&state) {
                    bus.emit("runtime:state", &state);
                    last = Some(state);
                }
            }
        })
    }
}
