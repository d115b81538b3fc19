//! Tool protocol abstraction.
//!
//! [`ToolProtocol`] is the capability set every tool-server transport in
//! [`crate::tool_protocols`] implements: `execute`, `list_tools`,
//! `get_tool_metadata`, plus a protocol identifier. The tool-calling loop
//! (C4) only ever calls through this trait — it never knows whether the
//! underlying transport is SSE, streamable-HTTP, or plain HTTP/JSON.
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_orchestrator_core::tool_protocol::ToolProtocol;
//! use llm_orchestrator_core::tool_protocols::resolve_tool_client;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = resolve_tool_client("http://localhost:8080").await?;
//! let tools = client.list_tools().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::cloudllm::client_wrapper::ToolSchema;

/// The result of one `call_tool` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self { success: true, output, error: None, metadata: HashMap::new() }
    }

    pub fn failure(error: String) -> Self {
        Self { success: false, output: serde_json::Value::Null, error: Some(error), metadata: HashMap::new() }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The scalar type of a [`ToolParameter`], used only when a transport builds
/// its own parameter list rather than forwarding a raw JSON Schema document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<serde_json::Value>,
    pub items: Option<Box<ToolParameterType>>,
    pub properties: Option<HashMap<String, ToolParameter>>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
            default: None,
            items: None,
            properties: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    fn to_json_schema_property(&self) -> serde_json::Value {
        let type_str = match self.param_type {
            ToolParameterType::String => "string",
            ToolParameterType::Number => "number",
            ToolParameterType::Integer => "integer",
            ToolParameterType::Boolean => "boolean",
            ToolParameterType::Array => "array",
            ToolParameterType::Object => "object",
        };
        let mut obj = serde_json::json!({ "type": type_str });
        if let Some(desc) = &self.description {
            obj["description"] = serde_json::Value::String(desc.clone());
        }
        obj
    }
}

/// Metadata about a tool, as returned by a transport's `list_tools`.
/// Converted to the provider-neutral [`ToolSchema`] (C1) via
/// [`ToolMetadata::to_tool_schema`] before it crosses into C3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), parameters: Vec::new() }
    }

    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Builds the JSON Schema object a provider adapter forwards to its
    /// `tools`/`functionDeclarations` wire field, from the declared
    /// parameter list.
    pub fn parameters_json_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(param.name.clone(), param.to_json_schema_property());
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": serde_json::Value::Object(properties),
            "required": required,
        })
    }

    pub fn to_tool_schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            parameters_json_schema: self.parameters_json_schema(),
        }
    }
}

/// Trait every tool-server transport (SSE, streamable-HTTP, plain HTTP/JSON)
/// implements. See [`crate::tool_protocols`] for the concrete clients and the
/// auto-detection algorithm that chooses one.
#[async_trait]
pub trait ToolProtocol: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>>;

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>>;

    async fn get_tool_metadata(
        &self,
        tool_name: &str,
    ) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>>;

    /// Protocol identifier, e.g. `"mcp-sse"`, `"mcp-streamable-http"`, `"plain-http"`.
    fn protocol_name(&self) -> &str;
}

/// Errors a [`ToolProtocol`] implementation can raise.
#[derive(Debug, Clone)]
pub enum ToolError {
    NotFound(String),
    ExecutionFailed(String),
    InvalidParameters(String),
    ProtocolError(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {name}"),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {msg}"),
            ToolError::InvalidParameters(msg) => write!(f, "Invalid parameters: {msg}"),
            ToolError::ProtocolError(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl Error for ToolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct MockProtocol;

    #[async_trait]
    impl ToolProtocol for MockProtocol {
        async fn execute(
            &self,
            tool_name: &str,
            _parameters: serde_json::Value,
        ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
            Ok(ToolResult::success(serde_json::json!({ "tool": tool_name, "result": "mock_result" })))
        }

        async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
            Ok(vec![ToolMetadata::new("mock_tool", "A mock tool")
                .with_parameter(ToolParameter::new("x", ToolParameterType::String).required())])
        }

        async fn get_tool_metadata(
            &self,
            _tool_name: &str,
        ) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
            Ok(ToolMetadata::new("mock_tool", "A mock tool"))
        }

        fn protocol_name(&self) -> &str {
            "mock"
        }
    }

    #[test]
    fn tool_parameter_builder_sets_fields() {
        let param = ToolParameter::new("expr", ToolParameterType::String)
            .with_description("an expression")
            .required()
            .with_default(serde_json::json!("2+2"));
        assert_eq!(param.name, "expr");
        assert!(param.required);
        assert_eq!(param.default, Some(serde_json::json!("2+2")));
    }

    #[test]
    fn tool_metadata_builds_json_schema_with_required_list() {
        let meta = ToolMetadata::new("calculator", "evaluates expressions")
            .with_parameter(ToolParameter::new("expression", ToolParameterType::String).required());
        let schema = meta.parameters_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"][0], "expression");
    }

    #[tokio::test]
    async fn mock_protocol_executes_and_lists_tools() {
        let protocol: Arc<dyn ToolProtocol> = Arc::new(MockProtocol);
        let result = protocol.execute("mock_tool", serde_json::json!({})).await.unwrap();
        assert!(result.success);
        let tools = protocol.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        let schema = tools[0].to_tool_schema();
        assert_eq!(schema.name, "mock_tool");
    }
}
