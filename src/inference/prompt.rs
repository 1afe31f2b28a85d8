//! System prompt for the text tool-call protocol.
//!
//! Backends without native tool calling learn about the available tools from
//! a catalog rendered into the system prompt, together with the exact tag
//! format their replies must use to request a call.

use serde_json::Value;

use super::types::ToolSpec;

/// Instructions appended after the tool catalog.
const TOOL_CALL_INSTRUCTIONS: &str = r#"## How to call a tool

To call a tool, reply with a tool call block in exactly this format:

<ToolCall>{"tool": "tool_name", "parameters": {"param": "value"}}</ToolCall>

Rules:
- The body must be a single valid JSON object with strictly matched brackets and quotes.
- Use only the tool names and parameter names listed above.
- You may emit several <ToolCall> blocks in one reply; they run in order.
- After the calls run you receive their results and can continue.
- If no tool is needed, answer normally without any <ToolCall> block."#;

/// Render the tool catalog and calling instructions.
///
/// Returns an empty string when there are no tools.
pub fn build_tool_system_prompt(tools: &[ToolSpec]) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let mut prompt = String::from("# Available tools\n\n");
    for tool in tools {
        prompt.push_str(&format!("## {}\n", tool.name));
        if !tool.description.trim().is_empty() {
            prompt.push_str(tool.description.trim());
            prompt.push('\n');
        }

        let params = describe_parameters(&tool.parameters);
        if params.is_empty() {
            prompt.push_str("Parameters: none\n");
        } else {
            prompt.push_str("Parameters:\n");
            for line in params {
                prompt.push_str(&line);
                prompt.push('\n');
            }
        }
        prompt.push('\n');
    }

    prompt.push_str(TOOL_CALL_INSTRUCTIONS);
    prompt
}

/// One line per schema property: name, type, required/optional, description.
fn describe_parameters(schema: &Value) -> Vec<String> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, prop)| {
            let ty = match prop.get("type") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(types)) => types
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" | "),
                _ => "any".to_string(),
            };
            let necessity = if required.contains(&name.as_str()) {
                "required"
            } else {
                "optional"
            };
            match prop.get("description").and_then(Value::as_str) {
                Some(desc) if !desc.trim().is_empty() => {
                    format!("- {name} ({ty}, {necessity}): {}", desc.trim())
                }
                _ => format!("- {name} ({ty}, {necessity})"),
            }
        })
        .collect()
}
