use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// JSON-schema type of one tool parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    fn json_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub required: bool,
    pub enum_values: Vec<String>,
}

impl ToolParameter {
    pub fn required(name: impl Into<String>, description: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            required: true,
            enum_values: Vec::new(),
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            required: false,
            enum_values: Vec::new(),
        }
    }

    pub fn with_enum(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }
}

/// Static description of one capability. Built once at startup; the
/// exposed schema is always generated from this, never from runtime
/// inspection of the handler.
#[derive(Clone, Debug)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, args: &Value) -> Result<Value, ToolError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{tool}` is missing required argument `{argument}`")]
    MissingArgument { tool: String, argument: String },
    #[error("tool `{tool}` failed: {message}")]
    Handler { tool: String, message: String },
}

/// Wire shape of the generated tool schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaFormat {
    OpenAi,
    Anthropic,
}

/// Registry of named capabilities the engine may invoke. Populated once
/// at process start; lookups and schema generation never mutate it.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, (ToolDescriptor, Arc<dyn ToolHandler>)>,
}

impl ToolRegistry {
    pub fn register(&mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(descriptor.name.clone(), (descriptor, handler));
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Generate the model-facing schema for the named tools. Unknown
    /// names are skipped; an empty filter exposes every registered tool.
    pub fn schema(&self, format: SchemaFormat, filter: &[String]) -> Vec<Value> {
        self.tools
            .values()
            .filter(|(descriptor, _)| filter.is_empty() || filter.contains(&descriptor.name))
            .map(|(descriptor, _)| render_schema(descriptor, format))
            .collect()
    }

    /// Invoke a tool after validating its required arguments are present.
    pub async fn invoke(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        let (descriptor, handler) =
            self.tools.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        for parameter in descriptor.parameters.iter().filter(|parameter| parameter.required) {
            let present = args.get(&parameter.name).map(|value| !value.is_null()).unwrap_or(false);
            if !present {
                return Err(ToolError::MissingArgument {
                    tool: name.to_string(),
                    argument: parameter.name.clone(),
                });
            }
        }

        handler.invoke(args).await
    }
}

fn render_schema(descriptor: &ToolDescriptor, format: SchemaFormat) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for parameter in &descriptor.parameters {
        let mut property = json!({
            "type": parameter.kind.json_type(),
            "description": parameter.description,
        });
        if !parameter.enum_values.is_empty() {
            property["enum"] = json!(parameter.enum_values);
        }
        properties.insert(parameter.name.clone(), property);
        if parameter.required {
            required.push(parameter.name.clone());
        }
    }

    let input_schema = json!({
        "type": "object",
        "properties": properties,
        "required": required,
    });

    match format {
        SchemaFormat::OpenAi => json!({
            "type": "function",
            "function": {
                "name": descriptor.name,
                "description": descriptor.description,
                "parameters": input_schema,
            }
        }),
        SchemaFormat::Anthropic => json!({
            "name": descriptor.name,
            "description": descriptor.description,
            "input_schema": input_schema,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{
        ParamKind, SchemaFormat, ToolDescriptor, ToolError, ToolHandler, ToolParameter,
        ToolRegistry,
    };

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
            Ok(json!({"echo": args}))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        registry.register(
            ToolDescriptor {
                name: "search_records".to_string(),
                description: "Search existing business records".to_string(),
                parameters: vec![
                    ToolParameter::required("query", "Search text", ParamKind::String),
                    ToolParameter::optional("limit", "Max results", ParamKind::Number),
                    ToolParameter::optional("scope", "Record type", ParamKind::String)
                        .with_enum(["customer", "supplier"]),
                ],
            },
            Arc::new(EchoHandler),
        );
        registry
    }

    #[test]
    fn required_list_contains_only_required_parameters() {
        let schema = registry().schema(SchemaFormat::OpenAi, &[]);
        assert_eq!(schema.len(), 1);

        let function = &schema[0]["function"];
        assert_eq!(function["name"], "search_records");
        assert_eq!(function["parameters"]["required"], json!(["query"]));
        assert_eq!(function["parameters"]["properties"]["scope"]["enum"], json!(["customer", "supplier"]));
    }

    #[test]
    fn anthropic_format_uses_input_schema() {
        let schema = registry().schema(SchemaFormat::Anthropic, &[]);
        assert_eq!(schema[0]["name"], "search_records");
        assert_eq!(schema[0]["input_schema"]["type"], "object");
        assert!(schema[0].get("function").is_none());
    }

    #[test]
    fn filter_restricts_exposed_tools() {
        let schema =
            registry().schema(SchemaFormat::OpenAi, &["render_document".to_string()]);
        assert!(schema.is_empty());
    }

    #[tokio::test]
    async fn invoke_validates_required_arguments() {
        let registry = registry();

        let error = registry.invoke("search_records", &json!({"limit": 3})).await.unwrap_err();
        assert!(matches!(
            error,
            ToolError::MissingArgument { ref argument, .. } if argument == "query"
        ));

        let result = registry.invoke("search_records", &json!({"query": "acme"})).await.unwrap();
        assert_eq!(result["echo"]["query"], "acme");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let error = registry().invoke("render_document", &json!({})).await.unwrap_err();
        assert!(matches!(error, ToolError::UnknownTool(_)));
    }
}
