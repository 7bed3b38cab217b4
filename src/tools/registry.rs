//! Tool registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::ToolDefinition;
use crate::tools::tool::{Tool, ToolSpec};

/// Registry of tools available to the agent.
///
/// Populated once at startup; lookups are lock-free afterwards. Names are
/// unique and duplicate registration is rejected.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Returns an error naming the conflict if a tool with
    /// the same name is already registered.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), String> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(format!("tool '{name}' is already registered"));
        }
        tracing::debug!(tool = %name, "Registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Specs for every registered tool, sorted by name for determinism.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Tool definitions in the shape the model client advertises.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.specs()
            .into_iter()
            .map(|s| ToolDefinition {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::{EchoTool, TimeTool};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        registry.register(Arc::new(TimeTool)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();

        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(err.contains("echo"));
    }

    #[test]
    fn test_definitions_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(TimeTool)).unwrap();
        registry.register(Arc::new(EchoTool)).unwrap();

        let defs = registry.definitions();
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[1].name, "time");
    }
}
