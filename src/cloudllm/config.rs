//! Request-scoped generation settings.
//!
//! [`GenerationConfig`] is the knob set a caller attaches to a chat request;
//! [`ProviderConfig`] layers the credentials a provider adapter needs on top
//! of it. Neither type parses a config *file* — callers construct these
//! directly, the same way this crate's config types have always left file
//! parsing to the embedder.
//!
//! # Example
//!
//! ```rust
//! use llm_orchestrator_core::config::GenerationConfig;
//!
//! let config = GenerationConfig { temperature: 0.2, ..GenerationConfig::default() };
//! assert!(config.validate().is_ok());
//! ```

use crate::cloudllm::error::OrchestratorError;
use serde::{Deserialize, Serialize};

/// Splits a `selectedModel` request field (`"<provider>:<model>"`) on its
/// *first* colon — model names may themselves contain colons (e.g.
/// `"qwen3:0.6b"`), so this is not a plain `split(':')`. Both sides must be
/// non-empty; anything else is an `InvalidRequest`.
pub fn parse_model_selector(selected_model: &str) -> Result<(&str, &str), OrchestratorError> {
    let (provider, model) = selected_model
        .split_once(':')
        .ok_or_else(|| OrchestratorError::InvalidRequest(format!("selectedModel '{selected_model}' has no colon")))?;
    if provider.is_empty() || model.is_empty() {
        return Err(OrchestratorError::InvalidRequest(format!(
            "selectedModel '{selected_model}' must have a non-empty provider and model"
        )));
    }
    Ok((provider, model))
}

/// Per-request generation settings. See field docs for defaults and ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Selects delivery mode: a live incremental stream (`true`) or a single
    /// final answer (`false`).
    pub stream: bool,
    /// Per-upstream-call deadline in milliseconds (C6).
    pub timeout_ms: u64,
    pub max_output_tokens: u32,
    /// Range 0.0-2.0.
    pub temperature: f32,
    /// Range 0.0-1.0.
    pub top_p: f32,
    /// Range -2.0-2.0. Silently dropped by providers that do not support it.
    pub presence_penalty: f32,
    /// Range -2.0-2.0. Silently dropped by providers that do not support it.
    pub frequency_penalty: f32,
    /// Base URL of the tool server to offer to the model. `None` means no
    /// tools are offered for this request.
    pub mcp_server_url: Option<String>,
    pub system_prompt: Option<String>,
    /// Hard cap on tool-calling loop iterations (C4). `0` means the loop may
    /// still complete in a single turn but must fail with
    /// `MaxIterationsExceeded` the moment the model asks for a tool.
    pub max_tool_calls: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            stream: true,
            timeout_ms: 60_000,
            max_output_tokens: 8_192,
            temperature: 1.0,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mcp_server_url: None,
            system_prompt: None,
            max_tool_calls: 5,
        }
    }
}

impl GenerationConfig {
    /// Validates the ranges documented on each field. Called once at the
    /// chat-entry boundary; internal components trust an already-validated
    /// config rather than re-checking on every read.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!("temperature {} out of range [0, 2]", self.temperature));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(format!("top_p {} out of range [0, 1]", self.top_p));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(format!("presence_penalty {} out of range [-2, 2]", self.presence_penalty));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(format!("frequency_penalty {} out of range [-2, 2]", self.frequency_penalty));
        }
        Ok(())
    }
}

/// A [`GenerationConfig`] plus the credentials a provider adapter needs to
/// reach its upstream: `GenerationConfig ⊕ { api_key, proxy_url? }`.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub generation: GenerationConfig,
    pub api_key: String,
    pub proxy_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { generation: GenerationConfig::default(), api_key: api_key.into(), proxy_url: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = GenerationConfig::default();
        assert!(config.stream);
        assert_eq!(config.timeout_ms, 60_000);
        assert_eq!(config.max_output_tokens, 8_192);
        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.max_tool_calls, 5);
        assert!(config.mcp_server_url.is_none());
    }

    #[test]
    fn validate_rejects_out_of_range_temperature() {
        let config = GenerationConfig { temperature: 3.0, ..GenerationConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_boundary_values() {
        let config = GenerationConfig {
            temperature: 2.0,
            top_p: 0.0,
            presence_penalty: -2.0,
            frequency_penalty: 2.0,
            ..GenerationConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    // Scenario E — selector parsing: splits on the *first* colon only, so a
    // model name that itself contains a colon stays intact on the right side.
    #[test]
    fn parse_model_selector_splits_on_first_colon_only() {
        assert_eq!(parse_model_selector("ollama:qwen3:0.6b").unwrap(), ("ollama", "qwen3:0.6b"));
    }

    #[test]
    fn parse_model_selector_rejects_empty_provider() {
        assert!(matches!(parse_model_selector(":foo"), Err(OrchestratorError::InvalidRequest(_))));
    }

    #[test]
    fn parse_model_selector_rejects_empty_model() {
        assert!(matches!(parse_model_selector("foo:"), Err(OrchestratorError::InvalidRequest(_))));
    }

    #[test]
    fn parse_model_selector_rejects_empty_string() {
        assert!(matches!(parse_model_selector(""), Err(OrchestratorError::InvalidRequest(_))));
    }
}
