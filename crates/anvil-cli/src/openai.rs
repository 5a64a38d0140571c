//! OpenAI-compatible chat-completions adapter.
//!
//! Works against any endpoint speaking the chat-completions dialect; point
//! `OPENAI_BASE_URL` at a compatible server to use another vendor. The
//! adapter does not stream; when a delta sink is supplied the final text is
//! delivered to it once.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use anvil_llm::{
    ChatMessage, CompletionRequest, Provider, ProviderError, ProviderResponse, Role,
    TextDeltaSink, ToolCall, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn from_env() -> Option<Arc<Self>> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        let base_url = std::env::var("OPENAI_BASE_URL").ok();
        Some(Arc::new(Self::new(api_key, base_url)))
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::from(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect::<Vec<_>>(),
            );
            body["tool_choice"] = Value::String("auto".to_string());
        }
        if let Some(session_id) = &request.session_id {
            body["user"] = Value::String(session_id.clone());
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        on_text_delta: Option<TextDeltaSink>,
    ) -> Result<ProviderResponse, ProviderError> {
        let api_key = request.api_key.clone().unwrap_or_else(|| self.api_key.clone());
        let body = self.request_body(&request);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(classify_transport_error)?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), payload));
        }

        let parsed: Value = serde_json::from_str(&payload)
            .map_err(|error| ProviderError::Fatal(format!("malformed response body: {error}")))?;
        let message = parsed
            .pointer("/choices/0/message")
            .ok_or_else(|| ProviderError::Fatal("response carries no message".to_string()))?;

        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = parse_tool_calls(message);
        if let (Some(on_text_delta), false) = (on_text_delta.as_ref(), text.is_empty()) {
            on_text_delta(&text);
        }

        Ok(ProviderResponse {
            message: ChatMessage::assistant_with_tool_calls(text, tool_calls),
            usage: parse_usage(parsed.get("usage")),
        })
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut out = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if !message.calls().is_empty() {
        out["tool_calls"] = Value::from(
            message
                .calls()
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect::<Vec<_>>(),
        );
    }
    if message.role == Role::Tool {
        if let Some(tool_call_id) = &message.tool_call_id {
            out["tool_call_id"] = Value::String(tool_call_id.clone());
        }
        if let Some(name) = &message.name {
            out["name"] = Value::String(name.clone());
        }
    }
    out
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(raw_calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };
    raw_calls
        .iter()
        .enumerate()
        .filter_map(|(index, raw)| {
            let name = raw.pointer("/function/name")?.as_str()?.to_string();
            let arguments = raw
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}")
                .to_string();
            let id = raw
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("tool_call_{index}"));
            Some(ToolCall::new(id, name, arguments))
        })
        .collect()
}

fn parse_usage(usage: Option<&Value>) -> Option<Usage> {
    let usage = usage?;
    let read = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    let input_tokens = read("prompt_tokens");
    let output_tokens = read("completion_tokens");
    let total_tokens = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(input_tokens + output_tokens);
    Some(Usage {
        input_tokens,
        output_tokens,
        total_tokens,
        cache_read_tokens: usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_write_tokens: 0,
    })
}

fn classify_transport_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() || error.is_connect() {
        ProviderError::Transient(format!("connection error: {error}"))
    } else {
        ProviderError::from_message(error.to_string())
    }
}
