use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_call_id: None }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self { role: Role::Tool, content: content.into(), tool_call_id: Some(tool_call_id.into()) }
    }
}

/// One tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// What the model returned for one completion call. `tool_calls` empty
/// means the text is the final answer.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ModelReply {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("model transport failure: {0}")]
    Transport(String),
    #[error("model provider rejected the request (status {status}): {message}")]
    Provider { status: u16, message: String },
}

/// The external model-provider boundary. Transport retries belong to the
/// caller, not to implementations.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        conversation: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ModelReply, LlmError>;
}

/// Deterministic client that replays a scripted reply sequence; used in
/// tests for the engine and the intake pipeline.
#[derive(Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<ModelReply, LlmError>>>,
    seen: Mutex<Vec<ScriptedCall>>,
}

#[derive(Clone, Debug)]
pub struct ScriptedCall {
    pub model: String,
    pub system_prompt: String,
    pub conversation: Vec<ChatMessage>,
    pub tool_count: usize,
}

impl ScriptedLlmClient {
    pub fn push_reply(&self, reply: ModelReply) {
        self.push(Ok(reply));
    }

    pub fn push_error(&self, error: LlmError) {
        self.push(Err(error));
    }

    fn push(&self, entry: Result<ModelReply, LlmError>) {
        match self.replies.lock() {
            Ok(mut replies) => replies.push_back(entry),
            Err(poisoned) => poisoned.into_inner().push_back(entry),
        }
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        match self.seen.lock() {
            Ok(seen) => seen.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        conversation: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ModelReply, LlmError> {
        match self.seen.lock() {
            Ok(mut seen) => seen.push(ScriptedCall {
                model: model.to_string(),
                system_prompt: system_prompt.to_string(),
                conversation: conversation.to_vec(),
                tool_count: tools.len(),
            }),
            Err(poisoned) => poisoned.into_inner().push(ScriptedCall {
                model: model.to_string(),
                system_prompt: system_prompt.to_string(),
                conversation: conversation.to_vec(),
                tool_count: tools.len(),
            }),
        }

        let next = match self.replies.lock() {
            Ok(mut replies) => replies.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| {
            Err(LlmError::Transport("scripted client ran out of replies".to_string()))
        })
    }
}
