use std::collections::HashMap;
use std::sync::Arc;

use flowgate_core::traits::NodeAdapter;

/// Node adapters keyed by node `type`.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn NodeAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter, replacing any previous one for the same type.
    pub fn register(&mut self, adapter: impl NodeAdapter) {
        self.register_arc(Arc::new(adapter));
    }

    pub fn register_arc(&mut self, adapter: Arc<dyn NodeAdapter>) {
        let node_type = adapter.node_type().to_string();
        self.adapters.insert(node_type, adapter);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeAdapter>> {
        self.adapters.get(node_type).cloned()
    }

    /// Registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.adapters.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Registry with the built-in `local_task` and `external_service` adapters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::adapters::LocalTaskAdapter);
        registry.register(crate::adapters::ExternalServiceAdapter::new());
        registry
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_keyed_by_type() {
        let registry = AdapterRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["external_service", "local_task"]);
        assert!(registry.get("local_task").is_some());
        assert!(registry.get("mcp_tool").is_none());
    }
}
