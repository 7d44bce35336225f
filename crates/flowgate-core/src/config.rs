use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowgateError, Result};
use crate::types::{ConcurrencyPolicy, RiskLevel};

/// Top-level flowgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub approvals: ApprovalsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub tool_stream: ToolStreamConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Global cap on simultaneously running executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    /// Persist a checkpoint after every node.
    #[serde(default = "default_true")]
    pub checkpoint: bool,
    /// Used when a plan omits `schedule.concurrency`.
    #[serde(default)]
    pub default_concurrency: ConcurrencyPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_concurrent_executions: default_max_concurrent(),
            checkpoint: true,
            default_concurrency: ConcurrencyPolicy::Allow,
        }
    }
}

fn default_data_dir() -> String { "~/.flowgate".to_string() }
fn default_max_concurrent() -> usize { 4 }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    /// Nodes at or above this risk require approval even without `requiresApproval`.
    #[serde(default = "default_require_at_risk")]
    pub require_at_risk: RiskLevel,
    /// Applied when a gated node has no `timeoutSeconds`. None = wait forever.
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            require_at_risk: default_require_at_risk(),
            default_timeout_secs: None,
        }
    }
}

fn default_require_at_risk() -> RiskLevel { RiskLevel::High }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    /// Outbound bytes an observer may have queued before messages are dropped.
    #[serde(default = "default_buffer_threshold")]
    pub buffer_threshold_bytes: usize,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
            buffer_threshold_bytes: default_buffer_threshold(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

fn default_bus_capacity() -> usize { 256 }
fn default_buffer_threshold() -> usize { 1024 * 1024 }
fn default_heartbeat_interval() -> u64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStreamConfig {
    /// Rotate the active file once it grows past this size.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_true")]
    pub compress_archives: bool,
}

impl Default for ToolStreamConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            compress_archives: true,
        }
    }
}

fn default_max_file_bytes() -> u64 { 5 * 1024 * 1024 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub servers: HashMap<String, BridgeServerConfig>,
    /// Tool calls carrying a risk level above this are refused before dispatch.
    #[serde(default)]
    pub deny_above: Option<RiskLevel>,
}

/// One remote tool endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeServerConfig {
    pub transport: BridgeTransportConfig,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Per-call timeout. None = no timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_user_id() -> String { "default".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_initial_delay() -> u64 { 500 }
fn default_max_delay() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_attempts() -> u32 { 8 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowgateError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowgateError::Config(e.to_string()))
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        let dir = &self.runtime.data_dir;
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(dir)
    }

    pub fn approvals_path(&self) -> PathBuf {
        self.data_dir().join("approvals.json")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.data_dir().join("executions")
    }

    pub fn checkpoint_db_path(&self) -> PathBuf {
        self.data_dir().join("checkpoints.db")
    }

    pub fn tool_stream_dir(&self) -> PathBuf {
        self.data_dir().join("tool-stream")
    }

    pub fn bridge_sessions_path(&self) -> PathBuf {
        self.data_dir().join("bridge-sessions.json")
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' || chars.peek() != Some(&'{') {
            result.push(c);
            continue;
        }
        chars.next();
        let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
        match std::env::var(&var_name) {
            Ok(val) => result.push_str(&val),
            // Unset variables are left as written
            Err(_) => {
                result.push_str("${");
                result.push_str(&var_name);
                result.push('}');
            }
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_set_variables() {
        std::env::set_var("FLOWGATE_TEST_BIND", "0.0.0.0:9000");
        let result = expand_env_vars("bind = \"${FLOWGATE_TEST_BIND}\"");
        assert_eq!(result, "bind = \"0.0.0.0:9000\"");
        std::env::remove_var("FLOWGATE_TEST_BIND");
    }

    #[test]
    fn leaves_unset_variables() {
        let result = expand_env_vars("url = \"${FLOWGATE_DEFINITELY_UNSET}/mcp\"");
        assert_eq!(result, "url = \"${FLOWGATE_DEFINITELY_UNSET}/mcp\"");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.runtime.max_concurrent_executions, 4);
        assert!(config.runtime.checkpoint);
        assert_eq!(config.runtime.default_concurrency, ConcurrencyPolicy::Allow);
        assert_eq!(config.approvals.require_at_risk, RiskLevel::High);
        assert_eq!(config.events.buffer_threshold_bytes, 1024 * 1024);
        assert_eq!(config.events.heartbeat_interval_secs, 30);
        assert_eq!(config.tool_stream.max_file_bytes, 5 * 1024 * 1024);
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert!(config.bridge.servers.is_empty());
        assert_eq!(config.bridge.deny_above, None);
    }

    #[test]
    fn bridge_servers_parse_with_reconnect_defaults() {
        let config = AppConfig::from_toml(
            r#"
[runtime]
data_dir = "/var/lib/flowgate"
default_concurrency = "queue"

[bridge]
deny_above = "medium"

[bridge.servers.search]
transport = { type = "stdio", command = "npx", args = ["-y", "search-mcp"] }
timeout_secs = 20

[bridge.servers.remote]
transport = { type = "http", url = "http://localhost:8080/mcp" }
user_id = "ops"

[bridge.servers.remote.reconnect]
max_attempts = 3
"#,
        )
        .unwrap();

        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/flowgate"));
        assert_eq!(config.runtime.default_concurrency, ConcurrencyPolicy::Queue);
        assert_eq!(config.bridge.deny_above, Some(RiskLevel::Medium));

        let search = &config.bridge.servers["search"];
        assert_eq!(search.user_id, "default");
        assert_eq!(search.timeout_secs, Some(20));
        assert_eq!(search.reconnect.initial_delay_ms, 500);
        assert!(matches!(
            &search.transport,
            BridgeTransportConfig::Stdio { command, args, .. } if command == "npx" && args.len() == 2
        ));

        let remote = &config.bridge.servers["remote"];
        assert_eq!(remote.user_id, "ops");
        assert_eq!(remote.reconnect.max_attempts, 3);
        assert_eq!(remote.reconnect.max_delay_ms, 30_000);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = AppConfig::from_toml("[runtime\nbroken").unwrap_err();
        assert!(matches!(err, FlowgateError::Config(_)));
    }
}
