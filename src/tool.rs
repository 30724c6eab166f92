//! Tool descriptors in the gateway's common shape.

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::GatewayError;

/// Result payload of a tool call (MCP `CallToolResult` object), passed through opaquely.
pub type ToolResult = Value;

/// Tool arguments, forwarded to the owning source without interpretation.
pub type ToolArguments = Option<Map<String, Value>>;

/// A tool exposed by exactly one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Name in the merged namespace.
    pub name: String,
    pub source_id: String,
    /// Name the owning source knows the tool by.
    pub upstream_name: String,
    pub description: Option<String>,
    /// Opaque JSON schema, passed through verbatim.
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Normalize one entry of an MCP `tools/list` result.
    pub fn from_wire(source_id: &str, tool: &Value) -> crate::Result<Self> {
        let obj = tool.as_object().ok_or_else(|| {
            GatewayError::ProtocolMismatch(source_id.to_string(), "tool entry is not an object".into())
        })?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                GatewayError::ProtocolMismatch(source_id.to_string(), "tool entry has no 'name'".into())
            })?;
        Ok(Self {
            name: name.to_string(),
            source_id: source_id.to_string(),
            upstream_name: name.to_string(),
            description: obj.get("description").and_then(Value::as_str).map(str::to_string),
            input_schema: obj
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object"})),
        })
    }

    /// Normalize a full `tools/list` result object (`{"tools": [...]}`).
    pub fn list_from_wire(source_id: &str, result: &Value) -> crate::Result<Vec<Self>> {
        let tools = result.get("tools").and_then(Value::as_array).ok_or_else(|| {
            GatewayError::ProtocolMismatch(
                source_id.to_string(),
                "tools/list result has no 'tools' array".into(),
            )
        })?;
        tools.iter().map(|t| Self::from_wire(source_id, t)).collect()
    }

    /// MCP wire form: `{name, description?, inputSchema}`.
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("name".into(), Value::String(self.name.clone()));
        if let Some(desc) = &self.description {
            obj.insert("description".into(), Value::String(desc.clone()));
        }
        obj.insert("inputSchema".into(), self.input_schema.clone());
        Value::Object(obj)
    }
}

/// Wrap text as a successful MCP tool result.
pub fn text_result(text: impl Into<String>) -> ToolResult {
    json!({
        "content": [{"type": "text", "text": text.into()}],
        "isError": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire_full_entry() {
        let tool = ToolDescriptor::from_wire(
            "aux",
            &json!({
                "name": "search",
                "description": "Search things",
                "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
            }),
        )
        .unwrap();
        assert_eq!(tool.name, "search");
        assert_eq!(tool.upstream_name, "search");
        assert_eq!(tool.source_id, "aux");
        assert_eq!(tool.input_schema["properties"]["q"]["type"], "string");
    }

    #[test]
    fn test_from_wire_missing_name() {
        let result = ToolDescriptor::from_wire("aux", &json!({"description": "x"}));
        assert!(matches!(result, Err(GatewayError::ProtocolMismatch(id, _)) if id == "aux"));
    }

    #[test]
    fn test_list_from_wire_requires_tools_array() {
        let result = ToolDescriptor::list_from_wire("aux", &json!({"items": []}));
        assert!(matches!(result, Err(GatewayError::ProtocolMismatch(_, msg)) if msg.contains("tools")));
    }

    #[test]
    fn test_to_wire_omits_missing_description() {
        let tool = ToolDescriptor::from_wire("aux", &json!({"name": "ping"})).unwrap();
        let wire = tool.to_wire();
        assert_eq!(wire, json!({"name": "ping", "inputSchema": {"type": "object"}}));
    }

    #[test]
    fn test_text_result_shape() {
        let result = text_result("hello");
        assert_eq!(result["content"][0]["text"], "hello");
        assert_eq!(result["isError"], false);
    }
}
