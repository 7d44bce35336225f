use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use flowgate_core::error::FlowgateError;
use flowgate_core::plan::PlanContext;
use flowgate_core::types::{ApprovalDecision, ApprovalStatus};
use flowgate_store::{ExportFormat, ExportOptions};

use crate::connection;
use crate::state::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn error_response(e: FlowgateError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        FlowgateError::PlanValidation(_)
        | FlowgateError::InvalidPayload { .. }
        | FlowgateError::UnknownEvent(_) => StatusCode::BAD_REQUEST,
        FlowgateError::ExecutionNotFound(_) | FlowgateError::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
        FlowgateError::ApprovalAlreadyDecided(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %e, "Request failed");
    }
    (status, Json(json!({ "error": e.to_string() })))
}

fn to_json<T: serde::Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| error_response(e.into()))
}

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut runtime = state.manager.runtime_state();
    runtime.dropped_messages = state.hub.dropped_messages();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "runtime": runtime,
        "observers": state.hub.observer_count(),
    }))
}

// GET /api/executions
pub async fn list_executions(State(state): State<Arc<AppState>>) -> ApiResult {
    let records = state.manager.list().map_err(error_response)?;
    to_json(&json!({ "executions": records }))
}

#[derive(Deserialize)]
pub struct StartExecutionBody {
    pub plan: Value,
    #[serde(default)]
    pub inputs: Value,
}

// POST /api/executions
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartExecutionBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let plan = PlanContext::parse(&body.plan).map_err(|e| error_response(e.into()))?;
    let inputs = if body.inputs.is_null() { json!({}) } else { body.inputs };

    let record = state
        .manager
        .submit(Arc::new(plan), inputs)
        .map_err(error_response)?;
    info!(execution_id = %record.id, plan_id = %record.plan_id, status = ?record.status, "Execution submitted");
    let Json(value) = to_json(&record)?;
    Ok((StatusCode::ACCEPTED, Json(value)))
}

// GET /api/executions/{id}
pub async fn get_execution(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    match state.manager.get(&id).map_err(error_response)? {
        Some(record) => to_json(&record),
        None => Err(error_response(FlowgateError::ExecutionNotFound(id))),
    }
}

// POST /api/executions/{id}/cancel
pub async fn cancel_execution(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let record = state.manager.cancel(&id).map_err(error_response)?;
    to_json(&record)
}

// GET /api/approvals
pub async fn list_approvals(State(state): State<Arc<AppState>>) -> ApiResult {
    let pending = state.broker.list_pending().map_err(error_response)?;
    to_json(&json!({ "pending": pending }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBody {
    pub status: ApprovalStatus,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

// POST /api/approvals/{id}
pub async fn decide_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> ApiResult {
    let decision = ApprovalDecision {
        status: body.status,
        decided_by: body.decided_by.unwrap_or_else(|| "gateway".to_string()),
        comment: body.comment,
    };
    let completed = state.broker.decide(&id, decision).await.map_err(error_response)?;
    to_json(&completed)
}

#[derive(Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default)]
    pub compress: bool,
}

// GET /api/tool-stream/{correlation}
pub async fn export_tool_stream(
    State(state): State<Arc<AppState>>,
    Path(correlation): Path<String>,
    Query(q): Query<ExportQuery>,
) -> Response {
    let Some(log) = state.tool_stream.as_ref() else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "tool-stream log is disabled" })))
            .into_response();
    };
    let opts = ExportOptions {
        format: q.format,
        compress: q.compress,
    };
    let content_type = match (opts.compress, opts.format) {
        (true, _) => "application/gzip",
        (false, ExportFormat::Json) => "application/json",
        (false, ExportFormat::Ndjson) => "application/x-ndjson",
    };
    let mut blocks = log.export_stream(Some(&correlation), opts).await;
    let body = Body::from_stream(futures::stream::poll_fn(move |cx| blocks.poll_recv(cx)));
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    info!("Observer connected");
    connection::handle_connection(socket, state.hub.clone()).await;
    debug!("Observer connection finished");
}
