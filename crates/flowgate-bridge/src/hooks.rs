use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use flowgate_core::config::BridgeConfig;
use flowgate_core::types::RiskLevel;

/// What a security hook sees before a tool call is dispatched.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
    pub correlation_id: String,
    pub risk_level: Option<RiskLevel>,
}

/// Returning `Err(reason)` vetoes the call.
pub type HookFn = Arc<dyn Fn(&ToolInvocation) -> std::result::Result<(), String> + Send + Sync>;

/// Security hooks consulted by [`crate::BridgeSession::invoke_tool`].
#[derive(Clone, Default)]
pub struct BridgeHooks {
    on_tool_invoke: Option<HookFn>,
    on_risky_tool: Option<HookFn>,
}

impl BridgeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trace every dispatch and refuse calls whose risk exceeds
    /// `config.deny_above`.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let hooks = Self::new().on_tool_invoke(|inv| {
            debug!(
                server = %inv.server_name,
                tool = %inv.tool_name,
                correlation_id = %inv.correlation_id,
                "Dispatching tool call"
            );
            Ok(())
        });
        match config.deny_above {
            Some(limit) => hooks.on_risky_tool(move |inv| match inv.risk_level {
                Some(risk) if risk > limit => Err(format!(
                    "tool '{}' is {} risk, above the allowed {}",
                    inv.tool_name, risk, limit
                )),
                _ => Ok(()),
            }),
            None => hooks,
        }
    }

    /// Runs before every invocation.
    pub fn on_tool_invoke<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ToolInvocation) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.on_tool_invoke = Some(Arc::new(hook));
        self
    }

    /// Runs after `on_tool_invoke` for invocations that carry a risk level.
    pub fn on_risky_tool<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ToolInvocation) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.on_risky_tool = Some(Arc::new(hook));
        self
    }

    /// Run the applicable hooks in order, stopping at the first veto.
    pub fn check(&self, invocation: &ToolInvocation) -> std::result::Result<(), String> {
        if let Some(hook) = &self.on_tool_invoke {
            hook(invocation)?;
        }
        if invocation.risk_level.is_some() {
            if let Some(hook) = &self.on_risky_tool {
                hook(invocation)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BridgeHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHooks")
            .field("on_tool_invoke", &self.on_tool_invoke.is_some())
            .field("on_risky_tool", &self.on_risky_tool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn invocation(risk: Option<RiskLevel>) -> ToolInvocation {
        ToolInvocation {
            server_name: "s".into(),
            tool_name: "delete_repo".into(),
            arguments: Value::Null,
            correlation_id: "c".into(),
            risk_level: risk,
        }
    }

    #[test]
    fn risky_hook_only_runs_with_risk_level() {
        let risky_calls = Arc::new(AtomicUsize::new(0));
        let counter = risky_calls.clone();
        let hooks = BridgeHooks::new().on_risky_tool(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hooks.check(&invocation(None)).unwrap();
        assert_eq!(risky_calls.load(Ordering::SeqCst), 0);
        hooks.check(&invocation(Some(RiskLevel::High))).unwrap();
        assert_eq!(risky_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_veto_wins() {
        let hooks = BridgeHooks::new()
            .on_tool_invoke(|inv| {
                if inv.tool_name.starts_with("delete") {
                    Err("destructive tools are disabled".into())
                } else {
                    Ok(())
                }
            })
            .on_risky_tool(|_| Err("unreachable".into()));
        let err = hooks.check(&invocation(Some(RiskLevel::High))).unwrap_err();
        assert_eq!(err, "destructive tools are disabled");
    }

    #[test]
    fn configured_limit_denies_only_above_it() {
        let config = BridgeConfig {
            deny_above: Some(RiskLevel::Medium),
            ..Default::default()
        };
        let hooks = BridgeHooks::from_config(&config);
        assert!(hooks.check(&invocation(None)).is_ok());
        assert!(hooks.check(&invocation(Some(RiskLevel::Medium))).is_ok());
        let err = hooks.check(&invocation(Some(RiskLevel::High))).unwrap_err();
        assert!(err.contains("high risk"), "{}", err);

        let open = BridgeHooks::from_config(&BridgeConfig::default());
        assert!(open.check(&invocation(Some(RiskLevel::High))).is_ok());
    }
}
