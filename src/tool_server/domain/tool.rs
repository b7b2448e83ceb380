//! Tool descriptors and call results exchanged with tool servers.

use super::ToolServerDomainError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata for a tool exposed by a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default = "empty_object_schema", rename = "inputSchema")]
    input_schema: Value,
    #[serde(default, rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    output_schema: Option<Value>,
}

fn empty_object_schema() -> Value {
    Value::Object(serde_json::Map::from_iter([(
        "type".to_owned(),
        Value::String("object".to_owned()),
    )]))
}

impl ToolDescriptor {
    /// Creates a tool descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError::EmptyToolName`] when the name is empty
    /// after trimming.
    pub fn new(name: impl Into<String>, input_schema: Value) -> Result<Self, ToolServerDomainError> {
        let normalized_name = name.into().trim().to_owned();
        if normalized_name.is_empty() {
            return Err(ToolServerDomainError::EmptyToolName);
        }
        Ok(Self {
            name: normalized_name,
            description: None,
            input_schema,
            output_schema: None,
        })
    }

    /// Sets a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let normalized = description.into().trim().to_owned();
        self.description = (!normalized.is_empty()).then_some(normalized);
        self
    }

    /// Sets an output schema.
    #[must_use]
    pub fn with_output_schema(mut self, output_schema: Value) -> Self {
        self.output_schema = Some(output_schema);
        self
    }

    /// Returns the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the optional description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the input schema.
    #[must_use]
    pub const fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Returns the optional output schema.
    #[must_use]
    pub const fn output_schema(&self) -> Option<&Value> {
        self.output_schema.as_ref()
    }
}

/// One content block of a tool call result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    /// Plain text output.
    Text {
        /// Text payload.
        text: String,
    },
    /// Base64-encoded image output.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type of the payload.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Any content kind this client does not interpret.
    #[serde(other)]
    Unsupported,
}

/// Successful result of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    content: Vec<ToolContent>,
    #[serde(
        default,
        rename = "structuredContent",
        skip_serializing_if = "Option::is_none"
    )]
    structured_content: Option<Value>,
}

impl ToolCallResult {
    /// Creates a result from content blocks.
    #[must_use]
    pub const fn new(content: Vec<ToolContent>) -> Self {
        Self {
            content,
            structured_content: None,
        }
    }

    /// Creates a single-text-block result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ToolContent::Text { text: text.into() }])
    }

    /// Attaches structured content.
    #[must_use]
    pub fn with_structured_content(mut self, value: Value) -> Self {
        self.structured_content = Some(value);
        self
    }

    /// Returns the content blocks.
    #[must_use]
    pub fn content(&self) -> &[ToolContent] {
        &self.content
    }

    /// Returns the structured content, if any.
    #[must_use]
    pub const fn structured_content(&self) -> Option<&Value> {
        self.structured_content.as_ref()
    }

    /// Concatenates every text block.
    #[must_use]
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Image { .. } | ToolContent::Unsupported => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_deserializes_wire_field_names() {
        let descriptor: ToolDescriptor = serde_json::from_value(json!({
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}
        }))
        .expect("descriptor should deserialize");

        assert_eq!(descriptor.name(), "read_file");
        assert_eq!(descriptor.description(), Some("Read a file"));
        assert_eq!(descriptor.input_schema()["properties"]["path"]["type"], "string");
    }

    #[test]
    fn descriptor_defaults_missing_schema() {
        let descriptor: ToolDescriptor =
            serde_json::from_value(json!({"name": "ping"})).expect("descriptor should deserialize");
        assert_eq!(descriptor.input_schema(), &json!({"type": "object"}));
    }

    #[test]
    fn call_result_joins_text_and_skips_unknown_blocks() {
        let result: ToolCallResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "hello "},
                {"type": "resource", "resource": {"uri": "file:///x"}},
                {"type": "text", "text": "world"}
            ]
        }))
        .expect("result should deserialize");

        assert_eq!(result.joined_text(), "hello world");
        assert_eq!(result.content().get(1), Some(&ToolContent::Unsupported));
    }

    #[test]
    fn blank_tool_names_are_rejected() {
        assert_eq!(
            ToolDescriptor::new(" ", json!({})),
            Err(ToolServerDomainError::EmptyToolName)
        );
    }
}
