use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::parse::resilient_parse;
use crate::tools::{SchemaFormat, ToolRegistry};

/// Last-resort model when neither context, profile, nor configuration
/// name one.
const FALLBACK_MODEL: &str = "llama3.1";

const DEFAULT_MAX_ITERATIONS: u32 = 4;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a back-office assistant that turns inbound business \
messages into structured change proposals. Use the available tools to look up existing records \
before deciding. Reply with a single JSON object with the fields `intent`, `entity_type`, \
`proposed_fields` (object) and `confidence` (number between 0 and 1).";

/// Per-invocation inputs. Built fresh for every run and threaded through
/// the loop explicitly; the engine itself holds no per-call state, which
/// is what makes concurrent runs on one shared engine safe.
#[derive(Clone, Debug)]
pub struct AgentRunContext {
    pub input_text: String,
    pub auxiliary_data: BTreeMap<String, Value>,
    pub tool_names: Vec<String>,
    pub max_iterations: u32,
    pub model_override: Option<String>,
}

impl AgentRunContext {
    pub fn new(input_text: impl Into<String>) -> Self {
        Self {
            input_text: input_text.into(),
            auxiliary_data: BTreeMap::new(),
            tool_names: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            model_override: None,
        }
    }
}

/// Externally supplied per-agent configuration.
#[derive(Clone, Debug, Default)]
pub struct AgentProfile {
    pub model: Option<String>,
    pub system_prompt_template: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub args: Value,
    pub result: Value,
}

/// Outcome of one engine run. `structured_data` is always populated:
/// parsed fields on success, a `parse_error` fallback otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    pub raw_output: String,
    pub structured_data: Value,
    pub parse_error: bool,
    pub tool_call_trace: Vec<ToolCallRecord>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// The bounded tool-calling loop. Shared across invocations; all
/// per-call state lives in [`AgentRunContext`] and loop locals.
pub struct AgentEngine {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    profile: AgentProfile,
    default_model: Option<String>,
    schema_format: SchemaFormat,
}

impl AgentEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        profile: AgentProfile,
        default_model: Option<String>,
        schema_format: SchemaFormat,
    ) -> Self {
        Self { llm, tools, profile, default_model, schema_format }
    }

    /// Run the loop to completion. Transport errors bubble up so the
    /// caller's retry policy applies; tool failures abort the loop into
    /// `AgentResult.error`; parse failures are flagged, never raised.
    pub async fn run(&self, ctx: &AgentRunContext) -> Result<AgentResult, AgentError> {
        let model = self.resolve_model(ctx)?;
        let system_prompt = self.resolve_system_prompt(ctx);
        let schema = self.tools.schema(self.schema_format, &ctx.tool_names);

        let mut conversation = vec![ChatMessage::user(&ctx.input_text)];
        let mut trace: Vec<ToolCallRecord> = Vec::new();
        let mut final_text = String::new();
        let max_iterations = ctx.max_iterations.max(1);

        for iteration in 0..max_iterations {
            let reply =
                self.llm.complete(model, &system_prompt, &conversation, &schema).await?;
            final_text = reply.text.clone();

            if reply.tool_calls.is_empty() {
                debug!(event_name = "agent.final_reply", iteration, "model produced final output");
                break;
            }

            conversation.push(ChatMessage::assistant(reply.text));
            for call in reply.tool_calls {
                match self.tools.invoke(&call.name, &call.arguments).await {
                    Ok(result) => {
                        conversation.push(ChatMessage::tool(result.to_string(), &call.id));
                        trace.push(ToolCallRecord {
                            tool_name: call.name,
                            args: call.arguments,
                            result,
                        });
                    }
                    Err(error) => {
                        warn!(
                            event_name = "agent.tool_failed",
                            tool = %call.name,
                            error = %error,
                            "tool invocation failed; aborting run"
                        );
                        let parsed = resilient_parse("");
                        return Ok(AgentResult {
                            success: false,
                            raw_output: String::new(),
                            structured_data: parsed.data,
                            parse_error: true,
                            tool_call_trace: trace,
                            error: Some(error.to_string()),
                        });
                    }
                }
            }
        }

        let parsed = resilient_parse(&final_text);
        info!(
            event_name = "agent.run_completed",
            model,
            tool_calls = trace.len(),
            parse_error = parsed.parse_error,
            "agent run finished"
        );

        Ok(AgentResult {
            success: true,
            raw_output: final_text,
            structured_data: parsed.data,
            parse_error: parsed.parse_error,
            tool_call_trace: trace,
            error: None,
        })
    }

    fn resolve_model<'a>(&'a self, ctx: &'a AgentRunContext) -> Result<&'a str, AgentError> {
        [
            ctx.model_override.as_deref(),
            self.profile.model.as_deref(),
            self.default_model.as_deref(),
            Some(FALLBACK_MODEL),
        ]
        .into_iter()
        .flatten()
        .find(|candidate| !candidate.trim().is_empty())
        .ok_or_else(|| {
            AgentError::Configuration(
                "no model resolved from run context, agent profile, or defaults".to_string(),
            )
        })
    }

    fn resolve_system_prompt(&self, ctx: &AgentRunContext) -> String {
        let Some(template) = self.profile.system_prompt_template.as_deref() else {
            return DEFAULT_SYSTEM_PROMPT.to_string();
        };

        let mut context = tera::Context::new();
        // Unknown variables render as their literal placeholder instead
        // of failing the run.
        for name in template_variables(template) {
            if !ctx.auxiliary_data.contains_key(&name) {
                context.insert(&name, &format!("{{{{{name}}}}}"));
            }
        }
        for (key, value) in &ctx.auxiliary_data {
            context.insert(key, value);
        }

        match tera::Tera::one_off(template, &context, false) {
            Ok(rendered) => rendered,
            Err(error) => {
                warn!(
                    event_name = "agent.prompt_render_failed",
                    error = %error,
                    "system prompt template failed to render; using it verbatim"
                );
                template.to_string()
            }
        }
    }
}

/// Names of `{{ ... }}` expressions in a template, trimmed.
fn template_variables(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else { break };
        let name = after[..close].trim();
        if !name.is_empty()
            && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            names.push(name.to_string());
        }
        rest = &after[close + 2..];
    }
    names
}
