//! Tool registry.
//!
//! A tool is a name, a declared input schema, and a handler that turns
//! validated arguments into a [`RelayCall`]. Tools hold no state: every call
//! is validated, relayed through the [`CommandDispatcher`], and its outcome
//! rendered as an MCP tool result.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{RegistryError, ValidationError};
use crate::relay::CommandDispatcher;

#[allow(clippy::trivially_copy_pass_by_ref)] // serde's skip_serializing_if requires a predicate fn(&T) -> bool, so we must take &bool here
const fn is_false(b: &bool) -> bool {
    !*b
}

/// Content item in a tool call response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
}

/// Result of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Content returned by the tool.
    pub content: Vec<ToolContent>,
    /// Whether the tool call resulted in an error.
    #[serde(skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Creates a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Creates an error text result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// The text of the first content item.
    #[must_use]
    pub fn first_text(&self) -> Option<&str> {
        self.content.first().map(|ToolContent::Text { text }| text.as_str())
    }
}

/// Shape a tool parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A JSON string.
    String,
    /// Any JSON number.
    Number,
    /// A JSON number with no fractional part.
    Integer,
    /// A JSON boolean.
    Boolean,
    /// An array whose items are all strings.
    StringArray,
}

impl ParamKind {
    const fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Number => "a number",
            Self::Integer => "an integer",
            Self::Boolean => "a boolean",
            Self::StringArray => "an array of strings",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::StringArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }

    fn json_schema(self) -> Value {
        match self {
            Self::String => json!({ "type": "string" }),
            Self::Number => json!({ "type": "number" }),
            Self::Integer => json!({ "type": "integer" }),
            Self::Boolean => json!({ "type": "boolean" }),
            Self::StringArray => json!({ "type": "array", "items": { "type": "string" } }),
        }
    }
}

/// One declared tool parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Parameter name as it appears in the arguments object.
    pub name: &'static str,
    /// Expected shape.
    pub kind: ParamKind,
    /// Whether the parameter must be present.
    pub required: bool,
    /// Human-readable description.
    pub description: &'static str,
}

impl ParamSpec {
    /// A required parameter.
    #[must_use]
    pub const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    /// An optional parameter.
    #[must_use]
    pub const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

/// A tool's declared input schema.
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    params: Vec<ParamSpec>,
}

impl InputSchema {
    /// A schema with no parameters.
    #[must_use]
    pub const fn empty() -> Self {
        Self { params: Vec::new() }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Declared parameters, in declaration order.
    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Renders the schema as JSON Schema for `tools/list`.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for spec in &self.params {
            let mut property = spec.kind.json_schema();
            if let Value::Object(ref mut obj) = property {
                obj.insert("description".to_string(), json!(spec.description));
            }
            properties.insert(spec.name.to_string(), property);
            if spec.required {
                required.push(json!(spec.name));
            }
        }

        let mut schema = json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            schema["required"] = Value::Array(required);
        }
        schema
    }

    /// Checks `arguments` against the schema.
    ///
    /// Missing arguments (`null`) are treated as an empty object, and a
    /// parameter set to `null` counts as absent. Only declared parameters are
    /// returned; anything else in the arguments object is dropped.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self, arguments: &Value) -> Result<Map<String, Value>, ValidationError> {
        let empty = Map::new();
        let obj = match arguments {
            Value::Null => &empty,
            Value::Object(obj) => obj,
            _ => return Err(ValidationError::NotAnObject),
        };

        let mut validated = Map::new();
        for spec in &self.params {
            match obj.get(spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(ValidationError::MissingParameter(spec.name.to_string()));
                    }
                }
                Some(value) if spec.kind.matches(value) => {
                    validated.insert(spec.name.to_string(), value.clone());
                }
                Some(_) => {
                    return Err(ValidationError::WrongType {
                        name: spec.name.to_string(),
                        expected: spec.kind.describe(),
                    });
                }
            }
        }
        Ok(validated)
    }
}

/// What a handler asks the relay to do.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayCall {
    /// Peer command name.
    pub command: String,
    /// Command parameters.
    pub params: Map<String, Value>,
    /// Prefix for the success text; `None` renders the payload alone.
    pub summary: Option<String>,
}

impl RelayCall {
    /// Relays `command` with `params` and renders the payload alone.
    #[must_use]
    pub fn new(command: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            params,
            summary: None,
        }
    }

    /// Prefixes the success text with `summary`.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Maps validated arguments to a relay call.
pub type ToolHandler = Arc<dyn Fn(&Map<String, Value>) -> RelayCall + Send + Sync>;

/// A registered tool.
#[derive(Clone)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Gerund phrase used in error text, e.g. "getting selection".
    pub operation: String,
    /// Declared input schema.
    pub schema: InputSchema,
    /// Builds the relay call.
    pub handler: ToolHandler,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("operation", &self.operation)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// `tools/list` entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolListing {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
}

/// The set of tools exposed to MCP clients, in registration order.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registers a tool.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateTool`] if the name is taken.
    pub fn register_tool<F>(
        &mut self,
        name: &str,
        description: &str,
        operation: &str,
        schema: InputSchema,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Map<String, Value>) -> RelayCall + Send + Sync + 'static,
    {
        if self.get(name).is_some() {
            return Err(RegistryError::DuplicateTool(name.to_string()));
        }
        self.tools.push(ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            operation: operation.to_string(),
            schema,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Looks up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Entries for `tools/list`.
    #[must_use]
    pub fn listings(&self) -> Vec<ToolListing> {
        self.tools
            .iter()
            .map(|tool| ToolListing {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.schema.to_json_schema(),
            })
            .collect()
    }

    /// Validates `arguments`, relays the resulting command and renders the
    /// outcome.
    ///
    /// Invalid arguments never reach the dispatcher.
    pub async fn call(
        &self,
        name: &str,
        arguments: &Value,
        dispatcher: &CommandDispatcher,
    ) -> ToolCallResult {
        let Some(tool) = self.get(name) else {
            return ToolCallResult::error(format!("Unknown tool: {name}"));
        };

        let params = match tool.schema.validate(arguments) {
            Ok(params) => params,
            Err(e) => {
                debug!(tool = name, error = %e, "Rejected tool arguments");
                return ToolCallResult::error(e.to_string());
            }
        };

        let call = (tool.handler)(&params);
        match dispatcher.invoke_default(&call.command, call.params).await {
            Ok(payload) => ToolCallResult::text(render_success(call.summary.as_deref(), &payload)),
            Err(e) => {
                warn!(tool = name, error = %e, "Tool call failed");
                ToolCallResult::error(format!("Error {}: {e}", tool.operation))
            }
        }
    }
}

fn render_success(summary: Option<&str>, payload: &Value) -> String {
    match summary {
        Some(summary) => format!("{summary}: {payload}"),
        None => serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string()),
    }
}
