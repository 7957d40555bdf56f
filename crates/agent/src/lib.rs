//! The bounded tool-calling decision loop: prompt construction, model
//! calls, tool dispatch, and the resilient parse that turns free-form
//! model output into structured data.

pub mod engine;
pub mod http;
pub mod llm;
pub mod parse;
pub mod tools;

pub use engine::{AgentEngine, AgentError, AgentProfile, AgentResult, AgentRunContext, ToolCallRecord};
pub use http::OpenAiCompatClient;
pub use llm::{ChatMessage, LlmClient, LlmError, ModelReply, Role, ScriptedLlmClient, ToolCallRequest};
pub use parse::{resilient_parse, ParsedOutput};
pub use tools::{
    ParamKind, SchemaFormat, ToolDescriptor, ToolError, ToolHandler, ToolParameter, ToolRegistry,
};
