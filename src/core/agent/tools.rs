use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::AgentError;
use crate::core::envelope::ToolResultEnvelope;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Runs the tool and returns the `tool_result` content string.
    async fn execute(&self, input: &Value) -> Result<String, AgentError>;
}

#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub requires_approval: bool,
    pub client_side: bool,
    executor: Option<Arc<dyn ToolExecutor>>,
}

impl ToolSpec {
    pub fn server(name: &str, description: &str, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            requires_approval: false,
            client_side: false,
            executor: Some(executor),
        }
    }

    /// A tool executed on the far side of the wire.
    pub fn client(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            requires_approval: false,
            client_side: true,
            executor: None,
        }
    }

    pub fn needs_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub async fn execute(&self, input: &Value) -> Result<String, AgentError> {
        match &self.executor {
            Some(executor) => executor.execute(input).await,
            None => Err(AgentError::Tool {
                tool: self.name.clone(),
                message: "tool executes on the client".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("requires_approval", &self.requires_approval)
            .field("client_side", &self.client_side)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn with(mut self, spec: ToolSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Server-side tool answering with a fixed envelope that echoes its input.
pub struct EnvelopeTool {
    message: String,
}

impl EnvelopeTool {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ToolExecutor for EnvelopeTool {
    async fn execute(&self, input: &Value) -> Result<String, AgentError> {
        ToolResultEnvelope::message(self.message.clone())
            .with_data(input.clone())
            .encode()
            .map_err(|e| AgentError::Execution(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn envelope_tool_wraps_input() {
        let spec = ToolSpec::server("run_query", "Run SQL", Arc::new(EnvelopeTool::new("done")))
            .needs_approval();
        assert!(spec.requires_approval);
        let out = spec.execute(&json!({"sql": "SELECT 1"})).await.unwrap();
        let env = ToolResultEnvelope::decode(&out).unwrap();
        assert_eq!(env.message.as_deref(), Some("done"));
        assert_eq!(env.data, Some(json!({"sql": "SELECT 1"})));
    }

    #[tokio::test]
    async fn client_tool_cannot_execute_locally() {
        let spec = ToolSpec::client("export_csv", "Export");
        let err = spec.execute(&json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::Tool { .. }));
    }

    #[test]
    fn registry_lists_sorted_names() {
        let reg = ToolRegistry::new()
            .with(ToolSpec::client("b_tool", ""))
            .with(ToolSpec::client("a_tool", ""));
        assert_eq!(reg.names(), vec!["a_tool", "b_tool"]);
        assert!(reg.get("a_tool").unwrap().client_side);
        assert!(reg.get("missing").is_none());
    }
}
