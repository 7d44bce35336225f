use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use flowgate_core::config::BridgeConfig;
use flowgate_core::error::{FlowgateError, Result};

use crate::backoff::ReconnectPolicy;
use crate::hooks::BridgeHooks;
use crate::session::{BridgeContext, BridgeSession, SessionOptions, SessionState};
use crate::transport::TransportFactory;

/// Per-server session slot, held across a connect so concurrent callers for
/// the same server share one attempt.
type Slot = Arc<Mutex<Option<BridgeSession>>>;

/// Lazily connected sessions for every configured bridge server.
pub struct BridgeManager {
    config: BridgeConfig,
    factory: Arc<dyn TransportFactory>,
    ctx: BridgeContext,
    hooks: BridgeHooks,
    sessions: Mutex<HashMap<String, Slot>>,
}

impl BridgeManager {
    pub fn new(config: BridgeConfig, factory: Arc<dyn TransportFactory>, ctx: BridgeContext) -> Self {
        Self {
            config,
            factory,
            ctx,
            hooks: BridgeHooks::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: BridgeHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Configured server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_configured(&self, server_name: &str) -> bool {
        self.config.servers.contains_key(server_name)
    }

    /// The session for `server_name`, connecting on first use.
    ///
    /// A session that gave up reconnecting is replaced by a fresh one. A slow
    /// or unreachable server only holds up callers of that server.
    pub async fn session(&self, server_name: &str) -> Result<BridgeSession> {
        let server = self.config.servers.get(server_name).ok_or_else(|| {
            FlowgateError::Config(format!("No bridge server configured: {}", server_name))
        })?;
        let slot = self
            .sessions
            .lock()
            .await
            .entry(server_name.to_string())
            .or_default()
            .clone();

        let mut current = slot.lock().await;
        if let Some(session) = current.as_ref() {
            if !matches!(session.state(), SessionState::Failed | SessionState::Closed) {
                return Ok(session.clone());
            }
        }

        let options = SessionOptions {
            server_name: server_name.to_string(),
            user_id: server.user_id.clone(),
            policy: ReconnectPolicy::from(&server.reconnect),
            call_timeout: server.timeout_secs.map(Duration::from_secs),
            hooks: self.hooks.clone(),
        };

        info!(server = %server_name, "Opening bridge session");
        let session = BridgeSession::connect(options, self.factory.clone(), self.ctx.clone()).await?;
        *current = Some(session.clone());
        Ok(session)
    }

    pub async fn close_all(&self) {
        let slots: Vec<Slot> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for slot in slots {
            let session = slot.lock().await.take();
            if let Some(session) = session {
                session.close().await;
            }
        }
    }
}
