use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use mailroom_core::config::LlmConfig;

use crate::llm::{ChatMessage, LlmClient, LlmError, ModelReply, ToolCallRequest};

/// How much of a provider error body is kept in the error message.
const ERROR_BODY_LEN: usize = 512;

/// Client for OpenAI-compatible chat-completion endpoints, which covers
/// OpenAI itself and local Ollama deployments.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        conversation: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ModelReply, LlmError> {
        let body = build_body(model, system_prompt, conversation, tools);
        debug!(event_name = "llm.request", model, messages = conversation.len() + 1, "calling model");

        let mut request =
            self.http.post(format!("{}/v1/chat/completions", self.base_url)).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response =
            request.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider {
                status: status.as_u16(),
                message: message.chars().take(ERROR_BODY_LEN).collect(),
            });
        }

        let payload: ChatCompletionResponse =
            response.json().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        Ok(parse_reply(payload))
    }
}

fn build_body(
    model: &str,
    system_prompt: &str,
    conversation: &[ChatMessage],
    tools: &[Value],
) -> Value {
    let mut messages = vec![json!({"role": "system", "content": system_prompt})];
    for message in conversation {
        let mut entry = json!({
            "role": message.role.as_str(),
            "content": message.content,
        });
        if let Some(tool_call_id) = &message.tool_call_id {
            entry["tool_call_id"] = json!(tool_call_id);
        }
        messages.push(entry);
    }

    let mut body = json!({"model": model, "messages": messages});
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    body
}

fn parse_reply(payload: ChatCompletionResponse) -> ModelReply {
    let Some(choice) = payload.choices.into_iter().next() else {
        return ModelReply::default();
    };

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCallRequest {
            id: call.id,
            name: call.function.name,
            // Providers send arguments as a JSON-encoded string.
            arguments: serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({})),
        })
        .collect();

    ModelReply { text: choice.message.content.unwrap_or_default(), tool_calls }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    name: String,
    arguments: String,
}
