// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// If you want to provide direct access (without having to navigate through the whole hierarchy) to certain types or functionalities at the crate level, you can use re-exports:

// Re-exporting key items for easier external access.
pub use cloudllm::client_wrapper::{
    validate_conversation, DurationUsage, Message, Role, TokenUsage, ToolCall, ToolSchema,
};
pub use cloudllm::config::{parse_model_selector, GenerationConfig, ProviderConfig};
pub use cloudllm::error::{AdapterError, AdapterErrorKind, OrchestratorError};
pub use cloudllm::orchestration::{run_tool_calling_loop, FinalAnswer, LoopOutcome};
pub use cloudllm::streaming::{multiplex_stream, FramingMode};
pub use cloudllm::tool_protocol::ToolProtocol;
pub use cloudllm::tool_protocols::resolve_tool_client;

// Submodules re-exported at the crate root so doc examples and external
// callers can write `llm_orchestrator_core::clients::openai` instead of
// reaching through `cloudllm`.
pub use cloudllm::client_wrapper;
pub use cloudllm::clients;
pub use cloudllm::config;
pub use cloudllm::error;
pub use cloudllm::orchestration;
pub use cloudllm::streaming;
pub use cloudllm::tool_protocol;
pub use cloudllm::tool_protocols;
