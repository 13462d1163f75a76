//! Tool definitions and the startup-time tool registry (spec §3 `ToolDefinition`).
//!
//! Unlike the teacher SDK's `Tool`, which bundles an executable handler for
//! its own in-process auto-execution loop, a `ToolDefinition` here is purely
//! declarative: name, description, and a JSON Schema of parameters. Handler
//! dispatch is a concern of the embedding CLI agent (out of scope per
//! spec §1), not of the router core.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A callable function the model may be offered (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    /// Accepts the same flexible schema notation as the teacher's
    /// `Tool::new` (simple type strings, extended per-property objects, or a
    /// full JSON Schema passed through unchanged) and normalizes it.
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: convert_schema_to_json_schema(schema),
        }
    }

    /// OpenAI-style function-calling wire representation, shared by every
    /// OpenAI-compatible adapter.
    pub fn to_openai_format(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Startup-initialized, read-only set of tools (spec §5: "registered tool
/// set … initialized at startup and thereafter read-only"). Keyed by name
/// with insertion-order-independent equality (`BTreeMap` orders by key);
/// registering a name that already exists is a no-op (spec §3: "silently
/// ignored at startup").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool`. If a tool with the same name is already present,
    /// the existing definition is kept and this call is a silent no-op.
    pub fn register(&mut self, tool: ToolDefinition) {
        self.tools.entry(tool.name.clone()).or_insert(tool);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn into_vec(self) -> Vec<ToolDefinition> {
        self.tools.into_values().collect()
    }
}

impl FromIterator<ToolDefinition> for ToolRegistry {
    fn from_iter<I: IntoIterator<Item = ToolDefinition>>(iter: I) -> Self {
        let mut registry = Self::new();
        for tool in iter {
            registry.register(tool);
        }
        registry
    }
}

fn type_to_json_schema(type_str: &str) -> Value {
    let schema_type = match type_str {
        "string" | "str" => "string",
        "number" | "float" | "f32" | "f64" => "number",
        "integer" | "int" | "i32" | "i64" => "integer",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        other => other,
    };
    serde_json::json!({ "type": schema_type })
}

/// Normalizes simple type notation or an extended per-property schema into a
/// full JSON Schema object. A schema that already carries `type` and
/// `properties` is assumed complete and passed through unchanged.
fn convert_schema_to_json_schema(schema: Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema;
    };
    if obj.contains_key("type") && obj.contains_key("properties") {
        return schema;
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (param_name, param_type) in obj {
        if let Some(type_str) = param_type.as_str() {
            properties.insert(param_name.clone(), type_to_json_schema(type_str));
            required.push(param_name.clone());
        } else if param_type.is_object() {
            let mut prop = param_type.clone();
            let prop_obj = prop.as_object_mut().expect("checked is_object above");

            let is_optional = prop_obj
                .remove("optional")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let is_required = prop_obj.remove("required").and_then(|v| v.as_bool());
            let has_default = prop_obj.contains_key("default");

            properties.insert(param_name.clone(), prop);

            if is_required == Some(true) {
                required.push(param_name.clone());
            } else if is_optional || is_required == Some(false) {
                // explicitly optional
            } else if !has_default {
                required.push(param_name.clone());
            }
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Validates that a tool-call argument string parses as JSON, surfacing a
/// typed error instead of the caller having to inspect the raw string
/// (used by adapters before re-parsing stored arguments, spec §4.2).
pub fn validate_arguments_json(arguments: &str) -> Result<Value> {
    serde_json::from_str(arguments)
        .map_err(|e| Error::invalid_input(format!("tool arguments are not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_type_notation_all_required() {
        let def = ToolDefinition::new(
            "add",
            "Add two numbers",
            serde_json::json!({"a": "number", "b": "number"}),
        );
        assert_eq!(def.parameters["type"], "object");
        assert_eq!(def.parameters["properties"]["a"]["type"], "number");
        let required = def.parameters["required"].as_array().unwrap();
        assert!(required.contains(&serde_json::json!("a")));
        assert!(required.contains(&serde_json::json!("b")));
    }

    #[test]
    fn test_extended_schema_optional_via_default() {
        let def = ToolDefinition::new(
            "search",
            "Search",
            serde_json::json!({
                "query": {"type": "string"},
                "limit": {"type": "integer", "default": 10}
            }),
        );
        let required = def.parameters["required"].as_array().unwrap();
        assert!(required.contains(&serde_json::json!("query")));
        assert!(!required.contains(&serde_json::json!("limit")));
    }

    #[test]
    fn test_full_json_schema_passthrough() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        });
        let def = ToolDefinition::new("f", "d", schema.clone());
        assert_eq!(def.parameters, schema);
    }

    #[test]
    fn test_registry_duplicate_registration_is_silently_ignored() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::new("add", "first", serde_json::json!({})));
        registry.register(ToolDefinition::new("add", "second", serde_json::json!({})));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("add").unwrap().description, "first");
    }

    #[test]
    fn test_registry_equality_is_insertion_order_independent() {
        let a: ToolRegistry = vec![
            ToolDefinition::new("a", "", serde_json::json!({})),
            ToolDefinition::new("b", "", serde_json::json!({})),
        ]
        .into_iter()
        .collect();
        let b: ToolRegistry = vec![
            ToolDefinition::new("b", "", serde_json::json!({})),
            ToolDefinition::new("a", "", serde_json::json!({})),
        ]
        .into_iter()
        .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_arguments_json() {
        assert!(validate_arguments_json(r#"{"x":1}"#).is_ok());
        assert!(validate_arguments_json("not json").is_err());
    }
}
