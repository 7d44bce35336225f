use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::EventBus;
use flowgate_core::types::{BridgeEventPayload, ChunkStatus, RiskLevel, ToolStreamChunk};
use flowgate_store::ToolStreamLog;

use crate::backoff::ReconnectPolicy;
use crate::hooks::{BridgeHooks, ToolInvocation};
use crate::registry::SessionRegistry;
use crate::transport::{
    BridgeTransport, Connection, ConnectRequest, ResumeToken, ToolDescriptor, TransportEvent,
    TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Reconnect attempts exhausted.
    Failed,
    /// Closed by the owner.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub server_name: String,
    pub user_id: String,
    pub policy: ReconnectPolicy,
    /// Bound on a single tool call, including any wait for a reconnect.
    pub call_timeout: Option<Duration>,
    pub hooks: BridgeHooks,
}

impl SessionOptions {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            user_id: "default".to_string(),
            policy: ReconnectPolicy::default(),
            call_timeout: None,
            hooks: BridgeHooks::default(),
        }
    }
}

/// Shared collaborators for every session in a process.
#[derive(Clone)]
pub struct BridgeContext {
    pub registry: Arc<SessionRegistry>,
    pub tool_stream: Option<Arc<ToolStreamLog>>,
    pub event_bus: Arc<EventBus>,
}

/// Per-call metadata for [`BridgeSession::invoke_tool`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Generated when absent.
    pub correlation_id: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub execution_id: Option<String>,
    pub plan_id: Option<String>,
    pub node_id: Option<String>,
    /// Abandons the call with `Cancelled` when triggered.
    pub cancel: Option<CancellationToken>,
}

/// One logical connection to a remote tool endpoint.
///
/// `connecting -> connected -> {disconnected, reconnecting} -> connected | failed`.
/// A background supervisor watches the transport's event stream and
/// reconnects with exponential backoff when it drops. Call [`close`](Self::close)
/// to stop the supervisor.
#[derive(Clone)]
pub struct BridgeSession {
    inner: Arc<Inner>,
}

struct Inner {
    options: SessionOptions,
    factory: Arc<dyn TransportFactory>,
    ctx: BridgeContext,
    transport: RwLock<Option<Arc<dyn BridgeTransport>>>,
    session_id: RwLock<Option<String>>,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
}

impl BridgeSession {
    /// Connect (resuming any recorded session) and start the supervisor.
    ///
    /// The initial connect retries on the same schedule as a reconnect.
    pub async fn connect(
        options: SessionOptions,
        factory: Arc<dyn TransportFactory>,
        ctx: BridgeContext,
    ) -> Result<Self> {
        let (state, _) = watch::channel(SessionState::Connecting);
        let inner = Arc::new(Inner {
            options,
            factory,
            ctx,
            transport: RwLock::new(None),
            session_id: RwLock::new(None),
            state,
            shutdown: CancellationToken::new(),
        });

        let connection = inner.establish(false).await?;
        let events = inner.install(connection);
        tokio::spawn(Arc::clone(&inner).supervise(events));
        Ok(Self { inner })
    }

    pub fn server_name(&self) -> &str {
        &self.inner.options.server_name
    }

    pub fn user_id(&self) -> &str {
        &self.inner.options.user_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().ok().and_then(|s| s.clone())
    }

    /// Call a remote tool.
    ///
    /// Security hooks run first and may veto the call, in which case nothing
    /// is recorded. Otherwise a `start` chunk is written, and exactly one
    /// `success` or `error` chunk follows, whatever the outcome. That includes
    /// cancellation through `options.cancel` and the caller dropping this
    /// future mid-call (an outer timeout, say).
    pub async fn invoke_tool(&self, tool_name: &str, arguments: Value, options: InvokeOptions) -> Result<Value> {
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let invocation = ToolInvocation {
            server_name: self.inner.options.server_name.clone(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            correlation_id: correlation_id.clone(),
            risk_level: options.risk_level,
        };
        if let Err(reason) = self.inner.options.hooks.check(&invocation) {
            warn!(server = %self.server_name(), tool = %tool_name, reason = %reason, "Tool call vetoed");
            return Err(FlowgateError::BridgeVetoed {
                tool: tool_name.to_string(),
                reason,
            });
        }

        let chunk = |status, message: String| {
            let mut chunk = ToolStreamChunk::new(&correlation_id, tool_name, status, message);
            chunk.execution_id = options.execution_id.clone();
            chunk.plan_id = options.plan_id.clone();
            chunk.node_id = options.node_id.clone();
            chunk
        };

        debug!(server = %self.server_name(), tool = %tool_name, correlation_id = %correlation_id, "Invoking tool");
        self.inner
            .record(chunk(ChunkStatus::Start, format!("invoking {}", tool_name)))
            .await;
        let mut terminal = TerminalGuard {
            inner: Arc::clone(&self.inner),
            fallback: Some(chunk(
                ChunkStatus::Error,
                "call abandoned before completion".to_string(),
            )),
        };

        let cancel = options.cancel.clone().unwrap_or_default();
        let result = tokio::select! {
            result = self.inner.bounded(tool_name, async {
                let transport = self.inner.wait_connected().await?;
                tokio::select! {
                    result = transport.call_tool(tool_name, arguments) => result,
                    _ = self.inner.until_terminal() => Err(self.inner.unavailable()),
                }
            }) => result,
            _ = cancel.cancelled() => Err(FlowgateError::Cancelled),
        };
        terminal.disarm();

        match &result {
            Ok(value) => {
                self.inner
                    .record(chunk(ChunkStatus::Success, value.to_string()))
                    .await
            }
            Err(e) => {
                warn!(server = %self.server_name(), tool = %tool_name, error = %e, "Tool call failed");
                self.inner.record(chunk(ChunkStatus::Error, e.to_string())).await
            }
        }
        result
    }

    /// The remote catalogue, fetched fresh on every call.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.inner
            .bounded("tools/list", async {
                let transport = self.inner.wait_connected().await?;
                tokio::select! {
                    result = transport.list_tools() => result,
                    _ = self.inner.until_terminal() => Err(self.inner.unavailable()),
                }
            })
            .await
    }

    /// Stop reconnecting and close the transport.
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let transport = self.inner.take_transport();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.inner.set_state(SessionState::Closed);
        self.inner
            .emit("bridge:disconnected", self.inner.payload(SessionState::Closed));
        info!(server = %self.server_name(), "Bridge session closed");
    }
}

/// Writes an `error` chunk if an invocation is dropped between its `start`
/// chunk and its terminal chunk.
struct TerminalGuard {
    inner: Arc<Inner>,
    fallback: Option<ToolStreamChunk>,
}

impl TerminalGuard {
    fn disarm(&mut self) {
        self.fallback = None;
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let Some(chunk) = self.fallback.take() else {
            return;
        };
        warn!(
            server = %self.inner.options.server_name,
            correlation_id = %chunk.correlation_id,
            "Tool call dropped mid-flight"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move { inner.record(chunk).await });
            }
            Err(_) => error!(
                server = %self.inner.options.server_name,
                "No runtime to record the closing chunk of a dropped tool call"
            ),
        }
    }
}

impl Inner {
    fn payload(&self, state: SessionState) -> BridgeEventPayload {
        BridgeEventPayload::new(&self.options.server_name, state.as_str())
    }

    fn emit(&self, event: &str, payload: BridgeEventPayload) {
        self.ctx.event_bus.emit(event, &payload);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn unavailable(&self) -> FlowgateError {
        FlowgateError::BridgeUnavailable {
            server: self.options.server_name.clone(),
        }
    }

    fn take_transport(&self) -> Option<Arc<dyn BridgeTransport>> {
        self.transport.write().ok().and_then(|mut t| t.take())
    }

    fn current_transport(&self) -> Option<Arc<dyn BridgeTransport>> {
        self.transport.read().ok().and_then(|t| t.clone())
    }

    async fn try_connect(&self) -> Result<Connection> {
        let resume = self
            .ctx
            .registry
            .get(&self.options.server_name, &self.options.user_id)
            .map(|record| ResumeToken {
                session_id: record.session_id,
                last_event_id: record.last_event_id,
            });
        self.factory
            .connect(ConnectRequest {
                server_name: self.options.server_name.clone(),
                user_id: self.options.user_id.clone(),
                resume,
            })
            .await
    }

    /// Connect, retrying with backoff. Ends in `Failed` when attempts run out.
    async fn establish(&self, after_drop: bool) -> Result<Connection> {
        let server = &self.options.server_name;
        let policy = &self.options.policy;
        let mut last_error = String::new();

        if !after_drop {
            self.set_state(SessionState::Connecting);
            self.emit("bridge:connecting", self.payload(SessionState::Connecting));
            match self.try_connect().await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(server = %server, error = %e, "Bridge connect failed");
                    last_error = e.to_string();
                }
            }
        }

        let mut failures: u32 = 0;
        while policy.allows(failures) {
            let delay = policy.delay(failures);
            self.set_state(SessionState::Reconnecting);
            let mut payload = self.payload(SessionState::Reconnecting);
            payload.attempt = Some(failures + 1);
            payload.delay_ms = Some(delay.as_millis() as u64);
            self.emit("bridge:reconnecting", payload);
            info!(server = %server, attempt = failures + 1, delay_ms = delay.as_millis() as u64, "Bridge reconnecting");

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(self.unavailable()),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.try_connect().await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(server = %server, attempt = failures + 1, error = %e, "Bridge reconnect failed");
                    last_error = e.to_string();
                    failures += 1;
                }
            }
        }

        error!(server = %server, attempts = failures, error = %last_error, "Bridge gave up reconnecting");
        self.set_state(SessionState::Failed);
        let mut payload = self.payload(SessionState::Failed);
        payload.attempt = Some(failures);
        payload.error = Some(last_error);
        self.emit("bridge:error", payload);
        Err(self.unavailable())
    }

    /// Adopt a fresh connection and hand back its event stream.
    fn install(&self, connection: Connection) -> mpsc::UnboundedReceiver<TransportEvent> {
        let Connection {
            transport,
            session_id,
            events,
        } = connection;

        let resumed = self
            .ctx
            .registry
            .get(&self.options.server_name, &self.options.user_id)
            .is_some_and(|r| r.session_id == session_id);
        if let Err(e) = self.ctx.registry.record_session(
            &self.options.server_name,
            &self.options.user_id,
            &session_id,
        ) {
            warn!(server = %self.options.server_name, error = %e, "Failed to record bridge session");
        }

        if let Ok(mut slot) = self.transport.write() {
            *slot = Some(Arc::from(transport));
        }
        if let Ok(mut slot) = self.session_id.write() {
            *slot = Some(session_id.clone());
        }
        self.set_state(SessionState::Connected);

        let mut payload = self.payload(SessionState::Connected);
        payload.message = Some(json!({"sessionId": session_id, "resumed": resumed}));
        self.emit("bridge:connected", payload);
        info!(server = %self.options.server_name, session_id = %session_id, resumed, "Bridge connected");
        events
    }

    async fn supervise(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let error = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(TransportEvent::Message { event_id, payload }) => {
                        if let Some(id) = &event_id {
                            if let Err(e) = self.ctx.registry.record_event(
                                &self.options.server_name,
                                &self.options.user_id,
                                id,
                            ) {
                                warn!(server = %self.options.server_name, error = %e, "Failed to record bridge event id");
                            }
                        }
                        let mut out = self.payload(SessionState::Connected);
                        out.message = Some(payload);
                        self.emit("bridge:message", out);
                        continue;
                    }
                    Some(TransportEvent::Closed { error }) => error,
                    None => None,
                },
            };

            if self.shutdown.is_cancelled() {
                return;
            }
            self.take_transport();
            self.set_state(SessionState::Disconnected);
            let mut payload = self.payload(SessionState::Disconnected);
            payload.error = error.clone();
            self.emit("bridge:disconnected", payload);
            warn!(server = %self.options.server_name, error = ?error, "Bridge disconnected");

            match self.establish(true).await {
                Ok(connection) => events = self.install(connection),
                Err(_) => return,
            }
        }
    }

    /// Resolve to the live transport, waiting out a reconnect if needed.
    async fn wait_connected(&self) -> Result<Arc<dyn BridgeTransport>> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state == SessionState::Connected {
                if let Some(transport) = self.current_transport() {
                    return Ok(transport);
                }
            }
            if state.is_terminal() {
                return Err(self.unavailable());
            }
            if rx.changed().await.is_err() {
                return Err(self.unavailable());
            }
        }
    }

    /// Resolves once the session can no longer serve calls.
    async fn until_terminal(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if rx.borrow_and_update().is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn bounded<T>(&self, what: &str, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match self.options.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(FlowgateError::Bridge(format!(
                    "{} on {} timed out after {}s",
                    what,
                    self.options.server_name,
                    limit.as_secs()
                ))),
            },
            None => call.await,
        }
    }

    /// Persist a chunk (when a log is configured) and relay it to observers.
    async fn record(&self, chunk: ToolStreamChunk) {
        match &self.ctx.tool_stream {
            Some(log) => match log.append_chunk(chunk).await {
                Ok((stored, summary)) => {
                    self.ctx.event_bus.emit("toolstream:chunk", &stored);
                    self.ctx.event_bus.emit("toolstream:summary", &summary);
                }
                Err(e) => warn!(server = %self.options.server_name, error = %e, "Failed to append tool-stream chunk"),
            },
            None => self.ctx.event_bus.emit("toolstream:chunk", &chunk),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use flowgate_core::event::EventEnvelope;
    use futures::future::BoxFuture;
    use tokio::sync::broadcast;

    /// Scripted in-process transport factory.
    #[derive(Default)]
    pub(crate) struct MockFactory {
        /// Connect attempts left to refuse.
        pub refuse: AtomicU32,
        pub requests: Mutex<Vec<ConnectRequest>>,
        pub senders: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
        pub list_calls: Arc<AtomicUsize>,
        pub tool_calls: Arc<Mutex<Vec<(String, Value)>>>,
    }

    impl MockFactory {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Simulate the server dropping the latest connection.
        pub(crate) fn drop_connection(&self) {
            if let Some(tx) = self.senders.lock().unwrap().last() {
                tx.send(TransportEvent::Closed {
                    error: Some("connection reset".into()),
                })
                .unwrap();
            }
        }

        pub(crate) fn push_message(&self, event_id: &str, payload: Value) {
            if let Some(tx) = self.senders.lock().unwrap().last() {
                tx.send(TransportEvent::Message {
                    event_id: Some(event_id.to_string()),
                    payload,
                })
                .unwrap();
            }
        }

        pub(crate) fn connects(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    struct MockTransport {
        list_calls: Arc<AtomicUsize>,
        tool_calls: Arc<Mutex<Vec<(String, Value)>>>,
    }

    impl BridgeTransport for MockTransport {
        fn call_tool(&self, tool_name: &str, arguments: Value) -> BoxFuture<'_, Result<Value>> {
            self.tool_calls
                .lock()
                .unwrap()
                .push((tool_name.to_string(), arguments.clone()));
            let tool = tool_name.to_string();
            Box::pin(async move {
                match tool.as_str() {
                    "boom" => Err(FlowgateError::Bridge("remote exploded".into())),
                    "hang" => futures::future::pending().await,
                    _ => Ok(json!({"tool": tool, "echo": arguments})),
                }
            })
        }

        fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolDescriptor>>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Ok(vec![ToolDescriptor {
                    name: "search".into(),
                    description: Some("Search the index".into()),
                    input_schema: json!({"type": "object"}),
                }])
            })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    impl TransportFactory for MockFactory {
        fn connect(&self, request: ConnectRequest) -> BoxFuture<'_, Result<Connection>> {
            let n = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request.clone());
                requests.len()
            };
            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            Box::pin(async move {
                if refused {
                    return Err(FlowgateError::Bridge("connection refused".into()));
                }
                let (tx, rx) = mpsc::unbounded_channel();
                self.senders.lock().unwrap().push(tx);
                let session_id = request
                    .resume
                    .map(|r| r.session_id)
                    .unwrap_or_else(|| format!("s-{}", n));
                Ok(Connection {
                    transport: Box::new(MockTransport {
                        list_calls: self.list_calls.clone(),
                        tool_calls: self.tool_calls.clone(),
                    }),
                    session_id,
                    events: rx,
                })
            })
        }
    }

    pub(crate) fn context(log: Option<Arc<ToolStreamLog>>) -> (BridgeContext, broadcast::Receiver<EventEnvelope>) {
        let bus = Arc::new(EventBus::new(1024));
        let rx = bus.subscribe();
        (
            BridgeContext {
                registry: Arc::new(SessionRegistry::in_memory()),
                tool_stream: log,
                event_bus: bus,
            },
            rx,
        )
    }

    pub(crate) fn options(max_attempts: u32) -> SessionOptions {
        SessionOptions {
            policy: ReconnectPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(1_000),
                multiplier: 2.0,
                max_attempts,
            },
            ..SessionOptions::new("search")
        }
    }

    /// Drain envelopes until `name` shows up; returns it.
    async fn until(rx: &mut broadcast::Receiver<EventEnvelope>, name: &str) -> EventEnvelope {
        loop {
            let env = rx.recv().await.unwrap();
            if env.event == name {
                return env;
            }
        }
    }

    fn log() -> (tempfile::TempDir, Arc<ToolStreamLog>) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(ToolStreamLog::open(dir.path(), 1 << 20, false).unwrap());
        (dir, log)
    }

    #[tokio::test]
    async fn connect_records_session_and_announces_it() {
        let factory = MockFactory::new();
        let (ctx, mut rx) = context(None);
        let registry = ctx.registry.clone();
        let session = BridgeSession::connect(options(3), factory.clone(), ctx).await.unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.session_id().as_deref(), Some("s-1"));
        assert_eq!(registry.get("search", "default").unwrap().session_id, "s-1");
        assert_eq!(rx.recv().await.unwrap().event, "bridge:connecting");
        let connected = rx.recv().await.unwrap();
        assert_eq!(connected.event, "bridge:connected");
        assert_eq!(connected.payload["message"]["resumed"], false);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn resumes_recorded_session() {
        let factory = MockFactory::new();
        let (ctx, mut rx) = context(None);
        ctx.registry.record_session("search", "default", "s-old").unwrap();
        ctx.registry.record_event("search", "default", "evt-3").unwrap();

        let session = BridgeSession::connect(options(3), factory.clone(), ctx).await.unwrap();
        let request = factory.requests.lock().unwrap()[0].clone();
        assert_eq!(
            request.resume,
            Some(ResumeToken {
                session_id: "s-old".into(),
                last_event_id: Some("evt-3".into()),
            })
        );
        assert_eq!(session.session_id().as_deref(), Some("s-old"));
        let connected = until(&mut rx, "bridge:connected").await;
        assert_eq!(connected.payload["message"]["resumed"], true);
        session.close().await;
    }

    #[tokio::test]
    async fn server_messages_advance_last_event_id() {
        let factory = MockFactory::new();
        let (ctx, mut rx) = context(None);
        let registry = ctx.registry.clone();
        let session = BridgeSession::connect(options(3), factory.clone(), ctx).await.unwrap();

        factory.push_message("evt-9", json!({"kind": "tools_changed"}));
        let env = until(&mut rx, "bridge:message").await;
        assert_eq!(env.payload["message"]["kind"], "tools_changed");
        assert_eq!(
            registry.get("search", "default").unwrap().last_event_id.as_deref(),
            Some("evt-9")
        );
        session.close().await;
    }

    #[tokio::test]
    async fn invoke_writes_start_then_success() {
        let factory = MockFactory::new();
        let (_dir, log) = log();
        let (ctx, mut rx) = context(Some(log.clone()));
        let session = BridgeSession::connect(options(3), factory.clone(), ctx).await.unwrap();

        let result = session
            .invoke_tool(
                "search",
                json!({"q": "rust"}),
                InvokeOptions {
                    correlation_id: Some("corr-1".into()),
                    execution_id: Some("exec-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result["echo"]["q"], "rust");

        let chunks = log.chunks(Some("corr-1")).await.unwrap();
        let statuses: Vec<ChunkStatus> = chunks.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![ChunkStatus::Start, ChunkStatus::Success]);
        assert!(chunks[0].sequence < chunks[1].sequence);
        assert_eq!(chunks[1].execution_id.as_deref(), Some("exec-1"));

        let summary = until(&mut rx, "toolstream:summary").await;
        assert_eq!(summary.payload["correlationId"], "corr-1");
        session.close().await;
    }

    #[tokio::test]
    async fn remote_failure_writes_one_error_chunk() {
        let factory = MockFactory::new();
        let (_dir, log) = log();
        let (ctx, _rx) = context(Some(log.clone()));
        let session = BridgeSession::connect(options(3), factory.clone(), ctx).await.unwrap();

        let err = session
            .invoke_tool(
                "boom",
                json!({}),
                InvokeOptions {
                    correlation_id: Some("corr-2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("remote exploded"));

        let chunks = log.chunks(Some("corr-2")).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].status, ChunkStatus::Error);
        assert!(chunks[1].message.contains("remote exploded"));
        assert!(log.summary("corr-2").await.unwrap().has_error);
        session.close().await;
    }

    async fn statuses(log: &ToolStreamLog, correlation_id: &str) -> Vec<ChunkStatus> {
        log.chunks(Some(correlation_id))
            .await
            .unwrap()
            .iter()
            .map(|c| c.status)
            .collect()
    }

    #[tokio::test]
    async fn cancelled_call_closes_its_stream() {
        let factory = MockFactory::new();
        let (_dir, log) = log();
        let (ctx, _rx) = context(Some(log.clone()));
        let session = BridgeSession::connect(options(3), factory, ctx).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = session
            .invoke_tool(
                "hang",
                json!({}),
                InvokeOptions {
                    correlation_id: Some("stopped".into()),
                    cancel: Some(cancel),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowgateError::Cancelled));

        assert_eq!(
            statuses(&log, "stopped").await,
            vec![ChunkStatus::Start, ChunkStatus::Error]
        );
        let chunks = log.chunks(Some("stopped")).await.unwrap();
        assert!(chunks[1].message.contains("cancelled"));
        session.close().await;
    }

    #[tokio::test]
    async fn dropped_call_still_gets_a_terminal_chunk() {
        let factory = MockFactory::new();
        let (_dir, log) = log();
        let (ctx, _rx) = context(Some(log.clone()));
        let session = BridgeSession::connect(options(3), factory, ctx).await.unwrap();

        let outer = tokio::time::timeout(
            Duration::from_millis(200),
            session.invoke_tool(
                "hang",
                json!({}),
                InvokeOptions {
                    correlation_id: Some("abandoned".into()),
                    ..Default::default()
                },
            ),
        )
        .await;
        assert!(outer.is_err());

        // The closing chunk is written from a task spawned on drop.
        let mut seen = Vec::new();
        for _ in 0..200 {
            seen = statuses(&log, "abandoned").await;
            if seen.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, vec![ChunkStatus::Start, ChunkStatus::Error]);
        let chunks = log.chunks(Some("abandoned")).await.unwrap();
        assert!(chunks[1].message.contains("abandoned before completion"));
        assert!(chunks[0].sequence < chunks[1].sequence);
        session.close().await;
    }

    #[tokio::test]
    async fn hook_veto_is_propagated_and_nothing_is_sent() {
        let factory = MockFactory::new();
        let (_dir, log) = log();
        let (ctx, _rx) = context(Some(log.clone()));
        let mut opts = options(3);
        opts.hooks = BridgeHooks::new().on_risky_tool(|inv| match inv.risk_level {
            Some(RiskLevel::High) => Err("high-risk tools need a human".into()),
            _ => Ok(()),
        });
        let session = BridgeSession::connect(opts, factory.clone(), ctx).await.unwrap();

        let err = session
            .invoke_tool(
                "drop_table",
                json!({}),
                InvokeOptions {
                    correlation_id: Some("corr-3".into()),
                    risk_level: Some(RiskLevel::High),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowgateError::BridgeVetoed { ref reason, .. } if reason == "high-risk tools need a human"));
        assert!(factory.tool_calls.lock().unwrap().is_empty());
        assert!(log.chunks(Some("corr-3")).await.unwrap().is_empty());

        // Same tool at medium risk passes.
        session
            .invoke_tool(
                "drop_table",
                json!({}),
                InvokeOptions {
                    risk_level: Some(RiskLevel::Medium),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn list_tools_is_not_cached() {
        let factory = MockFactory::new();
        let (ctx, _rx) = context(None);
        let session = BridgeSession::connect(options(3), factory.clone(), ctx).await.unwrap();

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "search");
        session.list_tools().await.unwrap();
        assert_eq!(factory.list_calls.load(Ordering::SeqCst), 2);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_exponential_backoff() {
        let factory = MockFactory::new();
        let (ctx, mut rx) = context(None);
        let session = BridgeSession::connect(options(5), factory.clone(), ctx).await.unwrap();
        until(&mut rx, "bridge:connected").await;

        factory.refuse.store(2, Ordering::SeqCst);
        factory.drop_connection();

        let disconnected = until(&mut rx, "bridge:disconnected").await;
        assert_eq!(disconnected.payload["error"], "connection reset");

        let mut delays = Vec::new();
        loop {
            let env = rx.recv().await.unwrap();
            match env.event.as_str() {
                "bridge:reconnecting" => delays.push(env.payload["delayMs"].as_u64().unwrap()),
                "bridge:connected" => break,
                _ => {}
            }
        }
        assert_eq!(delays, vec![100, 200, 400]);
        assert_eq!(session.state(), SessionState::Connected);
        // Reconnect resumes the same logical session.
        assert_eq!(session.session_id().as_deref(), Some("s-1"));
        assert_eq!(factory.connects(), 4);

        let result = session.invoke_tool("ping", json!({}), InvokeOptions::default()).await;
        assert!(result.is_ok());
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_and_fails_calls() {
        let factory = MockFactory::new();
        let (_dir, log) = log();
        let (ctx, mut rx) = context(Some(log.clone()));
        let session = BridgeSession::connect(options(2), factory.clone(), ctx).await.unwrap();

        factory.refuse.store(u32::MAX, Ordering::SeqCst);
        factory.drop_connection();

        let error = until(&mut rx, "bridge:error").await;
        assert_eq!(error.payload["attempt"], 2);
        assert_eq!(error.payload["error"], "Bridge error: connection refused");
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(factory.connects(), 3);

        let err = session
            .invoke_tool(
                "search",
                json!({}),
                InvokeOptions {
                    correlation_id: Some("late".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowgateError::BridgeUnavailable { .. }));
        let statuses: Vec<ChunkStatus> = log
            .chunks(Some("late"))
            .await
            .unwrap()
            .iter()
            .map(|c| c.status)
            .collect();
        assert_eq!(statuses, vec![ChunkStatus::Start, ChunkStatus::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_call_fails_when_session_gives_up() {
        let factory = MockFactory::new();
        let (ctx, _rx) = context(None);
        let session = BridgeSession::connect(options(1), factory.clone(), ctx).await.unwrap();

        let caller = session.clone();
        let call = tokio::spawn(async move {
            caller
                .invoke_tool("hang", json!({}), InvokeOptions::default())
                .await
        });
        tokio::task::yield_now().await;

        factory.refuse.store(u32::MAX, Ordering::SeqCst);
        factory.drop_connection();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(FlowgateError::BridgeUnavailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_bounds_a_hung_call() {
        let factory = MockFactory::new();
        let (ctx, _rx) = context(None);
        let mut opts = options(1);
        opts.call_timeout = Some(Duration::from_secs(5));
        let session = BridgeSession::connect(opts, factory, ctx).await.unwrap();

        let err = session
            .invoke_tool("hang", json!({}), InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 5s"));
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn initial_connect_failure_is_an_error() {
        let factory = MockFactory::new();
        factory.refuse.store(u32::MAX, Ordering::SeqCst);
        let (ctx, _rx) = context(None);
        let result = BridgeSession::connect(options(2), factory.clone(), ctx).await;
        assert!(matches!(result, Err(FlowgateError::BridgeUnavailable { .. })));
        assert_eq!(factory.connects(), 3);
    }
}
