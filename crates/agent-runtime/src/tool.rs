use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::control::ControlSignal;
use crate::coroutine::Yielder;
use crate::message::Message;
use crate::permission::preview_arguments;

/// How much human oversight a tool needs before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Runs without any permission check.
    None,
    /// Gated by the persisted allow/deny lists and a prompt.
    #[default]
    Loose,
    /// Gated like `Loose`; kept distinct so catalogs can tell them apart.
    Strict,
}

impl TrustLevel {
    pub fn requires_permission(self) -> bool {
        !matches!(self, TrustLevel::None)
    }
}

/// Describes a tool's interface for LLM consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name (e.g., "bash_execute", "file_read")
    pub name: String,
    /// Human-readable description for the LLM
    pub description: String,
    /// JSON Schema describing the expected input
    pub parameter_schema: Value,
    #[serde(default)]
    pub trust_level: TrustLevel,
}

/// A parsed request from the model to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this invocation (used to match results)
    pub id: String,
    pub name: String,
    /// JSON object of arguments
    pub parameters: Value,
}

/// Result of executing a tool, sent back to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Context passed to tool execution.
///
/// Tools that need to report progress or ask for their own sub-permissions
/// suspend through the same channel as the round that invoked them.
pub struct ToolContext<'a> {
    working_directory: &'a Path,
    co: &'a mut Yielder,
    emitted: Vec<Message>,
}

impl<'a> ToolContext<'a> {
    pub fn new(working_directory: &'a Path, co: &'a mut Yielder) -> Self {
        Self {
            working_directory,
            co,
            emitted: Vec::new(),
        }
    }

    pub fn working_directory(&self) -> &Path {
        self.working_directory
    }

    /// Yield a message from inside the tool and wait for the caller.
    ///
    /// An abort comes back as [`ToolError::Aborted`] so tools can `?` it.
    pub async fn suspend(&mut self, message: Message) -> Result<ControlSignal, ToolError> {
        self.emitted.push(message.clone());
        let control = self.co.suspend(message).await;
        if control.is_abort() {
            return Err(ToolError::Aborted);
        }
        Ok(control)
    }

    /// Messages the tool yielded itself, in order.
    pub(crate) fn take_emitted(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.emitted)
    }
}

/// The primary extension point: all tools implement this trait.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Plain-language description of what running this call would do, shown
    /// to the human in the permission prompt.
    fn describe(&self, parameters: &Value) -> String {
        let def = self.definition();
        format!(
            "The assistant wants to run the '{}' tool ({}) with arguments {}. Do you want to allow this?",
            def.name,
            def.description,
            preview_arguments(parameters)
        )
    }

    async fn execute(
        &self,
        parameters: Value,
        context: &mut ToolContext<'_>,
    ) -> Result<ToolResult, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Aborted by caller")]
    Aborted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.description)
    }
}

/// Simple echo tool for testing purposes.
pub struct EchoTool {
    trust_level: TrustLevel,
}

impl EchoTool {
    pub fn new(trust_level: TrustLevel) -> Self {
        Self { trust_level }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new(TrustLevel::None)
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echoes back the input message. For testing.".to_string(),
            parameter_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message to echo back"
                    }
                },
                "required": ["message"]
            }),
            trust_level: self.trust_level,
        }
    }

    async fn execute(
        &self,
        parameters: Value,
        _context: &mut ToolContext<'_>,
    ) -> Result<ToolResult, ToolError> {
        let message = parameters
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing 'message' field".to_string()))?;

        Ok(ToolResult::ok(message))
    }
}

/// Resolve the working directory a tool context should point at.
pub(crate) fn resolve_working_directory(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_level_gating() {
        assert!(!TrustLevel::None.requires_permission());
        assert!(TrustLevel::Loose.requires_permission());
        assert!(TrustLevel::Strict.requires_permission());
    }

    #[test]
    fn test_definition_trust_level_defaults_to_loose() {
        let def: ToolDefinition = serde_json::from_value(serde_json::json!({
            "name": "file_write",
            "description": "Write a file",
            "parameterSchema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(def.trust_level, TrustLevel::Loose);
    }

    #[test]
    fn test_default_description_mentions_tool_and_args() {
        let tool = EchoTool::default();
        let text = tool.describe(&serde_json::json!({"message": "hi"}));
        assert!(text.contains("'echo'"));
        assert!(text.contains("\"message\""));
    }

    #[test]
    fn test_resolve_working_directory_prefers_configured() {
        let dir = PathBuf::from("/srv/agent");
        assert_eq!(resolve_working_directory(Some(&dir)), dir);
    }
}
