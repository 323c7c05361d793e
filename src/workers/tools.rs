//! Named tools workers expose to the language-model boundary
//!
//! A tool is a name, a JSON-schema input description, and a typed handler.
//! Registration is insertion into a map keyed by name; the registry
//! serializes itself to the schema the model service expects.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::WorkerError;

/// A tool's externally visible description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's input
    pub schema: Value,
}

/// Typed handler invoked when the model calls a tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, arguments: Value) -> Result<Value, WorkerError>;
}

/// Registry of callable tools keyed by name
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, (ToolDefinition, Arc<dyn ToolHandler>)>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. Re-registering a name replaces the previous
    /// handler.
    pub fn register(&mut self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        self.tools
            .insert(definition.name.clone(), (definition, handler));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Serializes the registry to the tool schema offered to the model
    #[must_use]
    pub fn schema(&self) -> Value {
        let entries: Vec<Value> = self
            .tools
            .values()
            .map(|(def, _)| {
                json!({
                    "name": def.name,
                    "description": def.description,
                    "parameters": def.schema,
                })
            })
            .collect();
        Value::Array(entries)
    }

    /// Invokes a tool by name
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, WorkerError> {
        let Some((_, handler)) = self.tools.get(name) else {
            return Err(WorkerError::UnknownTool {
                name: name.to_string(),
            });
        };
        handler.invoke(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn invoke(&self, arguments: Value) -> Result<Value, WorkerError> {
            Ok(json!({ "echo": arguments }))
        }
    }

    fn definition(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: "echoes its input".to_string(),
            schema: json!({ "type": "object" }),
        }
    }

    #[tokio::test]
    async fn registered_tools_are_invocable() {
        let mut registry = ToolRegistry::new();
        registry.register(definition("echo"), Arc::new(Echo));

        let result = registry.invoke("echo", json!({"a": 1})).await.unwrap();
        assert_eq!(result, json!({"echo": {"a": 1}}));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::UnknownTool { .. }));
    }

    #[test]
    fn schema_lists_every_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(definition("a"), Arc::new(Echo));
        registry.register(definition("b"), Arc::new(Echo));
        let schema = registry.schema();
        assert_eq!(schema.as_array().map(Vec::len), Some(2));
        assert_eq!(schema[0]["name"], json!("a"));
    }

    #[test]
    fn reregistration_replaces_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(definition("a"), Arc::new(Echo));
        registry.register(definition("a"), Arc::new(Echo));
        assert_eq!(registry.len(), 1);
    }
}
