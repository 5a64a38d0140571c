use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::types::{ChatMessage, ProviderResponse, ToolDefinition};

/// Callback invoked with incremental assistant text while a completion
/// streams. Adapters that do not stream may deliver the final text once.
pub type TextDeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

/// One completion request as assembled by the reactive loop.
#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub session_id: Option<String>,
    /// Per-turn credential resolved by the `get_api_key` hook; adapters fall
    /// back to their ambient configuration when absent.
    pub api_key: Option<String>,
}

/// Provider adapter contract.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: CompletionRequest,
        on_text_delta: Option<TextDeltaSink>,
    ) -> Result<ProviderResponse, ProviderError>;
}
