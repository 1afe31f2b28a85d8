//! Tool call parsing — normalizes model output to `ToolCall` structs.
//!
//! Two sources of tool calls are handled here:
//!
//! 1. **Native** — OpenAI-style `tool_calls` deltas. The name and the
//!    JSON-encoded arguments arrive as separate strings and are assembled by
//!    the streaming layer before reaching [`parse_native_json_tool_call`].
//!
//! 2. **Text-embedded** — spans cut out of the reply text by the tag scanner.
//!    A span body is read in one of two dialects:
//!
//!    - JSON (preferred), a single object or an array of objects:
//!      ```text
//!      {"tool": "read_file", "parameters": {"path": "/tmp/a.txt"}}
//!      ```
//!      `name`/`tool` and `parameters`/`args`/`arguments` are accepted
//!      interchangeably; string-encoded arguments are decoded a second time.
//!
//!    - XML-like (fallback):
//!      ```text
//!      <name>read_file</name><parameters><path>/tmp/a.txt</path></parameters>
//!      <invoke name="read_file"><parameter name="path">/tmp/a.txt</parameter></invoke>
//!      ```
//!
//! A span that fails both dialects is logged and dropped. Extraction never
//! fails as a whole.

use std::collections::HashSet;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::errors::InferenceError;
use super::scanner;
use super::types::ToolCall;

/// Keys accepted for the tool name, in priority order.
const NAME_KEYS: &[&str] = &["name", "tool"];

/// Keys accepted for the arguments object, in priority order.
const ARGUMENT_KEYS: &[&str] = &["parameters", "args", "arguments"];

/// XML-like elements that carry the tool name.
const XML_NAME_ELEMENTS: &[&str] = &["name", "tool", "tool_name", "function_name"];

/// XML-like elements whose children are the arguments.
const XML_ARGUMENT_ELEMENTS: &[&str] = &["parameters", "args", "arguments"];

/// XML-like elements that name the tool through a `name="…"` attribute.
const XML_INVOKE_ELEMENTS: &[&str] = &["invoke", "function"];

// ─── Native JSON Parsing ─────────────────────────────────────────────────────

/// Parse a tool call from accumulated native streaming deltas.
///
/// `name` and `arguments_json` are the concatenated values from all chunks
/// for a single tool call index. Empty arguments mean "no arguments".
pub fn parse_native_json_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    let call_id = id
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));

    if name.is_empty() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let arguments = decode_arguments(Some(&Value::String(arguments_json.to_string())))
        .map_err(|reason| InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason,
        })?;

    Ok(ToolCall::new(call_id, name, arguments))
}

// ─── Extractor ───────────────────────────────────────────────────────────────

/// A call as read from a span, before batch-level id assignment.
#[derive(Debug, Clone, PartialEq)]
struct RawCall {
    id: Option<String>,
    name: String,
    arguments: Map<String, Value>,
}

/// Turns span bodies into `ToolCall`s for one reply (one extraction batch).
///
/// Ids are unique within the batch: model-supplied ids are kept unless they
/// repeat, and missing or repeated ids are synthesized from the tool name, the
/// call's index in the batch and the batch timestamp.
#[derive(Debug)]
pub struct ToolCallExtractor {
    batch_timestamp: i64,
    next_index: usize,
    seen_ids: HashSet<String>,
}

impl Default for ToolCallExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallExtractor {
    pub fn new() -> Self {
        Self::with_timestamp(chrono::Utc::now().timestamp_millis())
    }

    /// Create an extractor with a fixed batch timestamp (deterministic ids).
    pub fn with_timestamp(batch_timestamp: i64) -> Self {
        Self {
            batch_timestamp,
            next_index: 0,
            seen_ids: HashSet::new(),
        }
    }

    /// Admit a call decoded elsewhere (e.g. native tool calling) into this
    /// batch, re-synthesizing its id if it is empty or already taken.
    pub fn admit(&mut self, call: ToolCall) -> ToolCall {
        let ToolCall {
            id,
            name,
            arguments,
            result,
        } = call;
        let mut admitted = self.assign_id(RawCall {
            id: Some(id),
            name,
            arguments,
        });
        admitted.result = result;
        admitted
    }

    /// Extract the calls in one span body. Never fails: a span that parses
    /// under neither dialect is logged and yields nothing.
    pub fn extract_span(&mut self, body: &str) -> Vec<ToolCall> {
        match parse_span(body) {
            Ok(raw_calls) => raw_calls.into_iter().map(|raw| self.assign_id(raw)).collect(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    body_preview = %preview(body),
                    "skipping unparseable tool call span"
                );
                Vec::new()
            }
        }
    }

    fn assign_id(&mut self, raw: RawCall) -> ToolCall {
        let index = self.next_index;
        self.next_index += 1;

        let id = match raw.id {
            Some(id) if !id.is_empty() && !self.seen_ids.contains(&id) => id,
            _ => {
                let mut candidate = format!("{}_{index}_{}", raw.name, self.batch_timestamp);
                let mut suffix = 1;
                while self.seen_ids.contains(&candidate) {
                    candidate = format!("{}_{index}_{}_{suffix}", raw.name, self.batch_timestamp);
                    suffix += 1;
                }
                candidate
            }
        };

        self.seen_ids.insert(id.clone());
        ToolCall::new(id, raw.name, raw.arguments)
    }
}

/// Scan a complete reply text and extract every embedded tool call.
///
/// Returns the visible text (tool-call spans removed) and the calls.
pub fn extract_tool_calls(text: &str) -> (String, Vec<ToolCall>) {
    let (content, spans) = scanner::split_tool_spans(text);
    let mut extractor = ToolCallExtractor::new();
    let calls = spans
        .iter()
        .flat_map(|span| extractor.extract_span(span))
        .collect();
    (content, calls)
}

/// Whether a span body yields at least one tool call.
pub fn parses_as_tool_call(body: &str) -> bool {
    parse_span(body).map(|calls| !calls.is_empty()).unwrap_or(false)
}

fn parse_span(body: &str) -> Result<Vec<RawCall>, InferenceError> {
    let text = strip_code_fence(body.trim());

    match parse_json_dialect(text) {
        Ok(calls) => Ok(calls),
        Err(json_err) => match parse_xml_dialect(text) {
            Some(calls) if !calls.is_empty() => Ok(calls),
            _ => Err(json_err),
        },
    }
}

/// Strip a surrounding markdown code fence (```` ```json … ``` ````).
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = rest.trim_end().strip_suffix("```") else {
        return text;
    };
    // Drop the info string (`json`, `xml`, …) on the opening line.
    match inner.find('\n') {
        Some(nl) if !inner[..nl].trim().contains(['{', '[', '<']) => inner[nl + 1..].trim(),
        _ => inner.trim(),
    }
}

// ─── JSON Dialect ────────────────────────────────────────────────────────────

fn parse_json_dialect(text: &str) -> Result<Vec<RawCall>, InferenceError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| InferenceError::ToolCallParseError {
            raw_response: text.to_string(),
            reason: format!("invalid JSON: {e}"),
        })?;

    match value {
        Value::Object(obj) => Ok(vec![raw_call_from_object(&obj).map_err(|reason| {
            InferenceError::ToolCallParseError {
                raw_response: text.to_string(),
                reason,
            }
        })?]),
        Value::Array(items) => {
            let mut calls = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let parsed = item
                    .as_object()
                    .ok_or_else(|| "array element is not an object".to_string())
                    .and_then(raw_call_from_object);
                match parsed {
                    Ok(call) => calls.push(call),
                    Err(reason) => {
                        tracing::warn!(index = i, reason = %reason, "skipping tool call array element");
                    }
                }
            }
            if calls.is_empty() && !items.is_empty() {
                return Err(InferenceError::ToolCallParseError {
                    raw_response: text.to_string(),
                    reason: "no usable tool call in array".into(),
                });
            }
            Ok(calls)
        }
        _ => Err(InferenceError::ToolCallParseError {
            raw_response: text.to_string(),
            reason: "expected a JSON object or array".into(),
        }),
    }
}

fn raw_call_from_object(obj: &Map<String, Value>) -> Result<RawCall, String> {
    let name = NAME_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "missing tool name".to_string())?;

    let arguments = decode_arguments(ARGUMENT_KEYS.iter().find_map(|k| obj.get(*k)))?;

    Ok(RawCall {
        id: obj.get("id").and_then(Value::as_str).map(String::from),
        name: name.to_string(),
        arguments,
    })
}

/// Normalize an arguments value to an object.
///
/// Absent/null/empty-string arguments become `{}`; strings are decoded as
/// JSON (models frequently double-encode their arguments).
fn decode_arguments(value: Option<&Value>) -> Result<Map<String, Value>, String> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Map::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err("string-encoded arguments are not an object".into()),
            Err(e) => Err(format!("invalid JSON arguments: {e}")),
        },
        Some(_) => Err("arguments must be an object".into()),
    }
}

// ─── XML-like Dialect ────────────────────────────────────────────────────────

/// A located element: its attribute text, inner text and end offset.
struct Element<'a> {
    attrs: &'a str,
    inner: &'a str,
    end: usize,
}

fn parse_xml_dialect(text: &str) -> Option<Vec<RawCall>> {
    // Form 1: <invoke name="tool"><parameter name="k">v</parameter></invoke>
    let mut calls = Vec::new();
    for tag in XML_INVOKE_ELEMENTS {
        let mut from = 0;
        while let Some(el) = find_element(text, tag, from) {
            from = el.end;
            if let Some(name) = attr_value(el.attrs, "name").filter(|n| !n.is_empty()) {
                calls.push(RawCall {
                    id: None,
                    name,
                    arguments: collect_xml_arguments(el.inner),
                });
            }
        }
    }
    if !calls.is_empty() {
        return Some(calls);
    }

    // Form 2: <name>tool</name> followed by parameter elements
    let name = XML_NAME_ELEMENTS
        .iter()
        .find_map(|tag| find_element(text, tag, 0))
        .map(|el| el.inner.trim().to_string())
        .filter(|n| !n.is_empty() && !n.contains('<'))?;

    Some(vec![RawCall {
        id: None,
        name,
        arguments: collect_xml_arguments(text),
    }])
}

/// Flat string arguments from `<parameter name="k">v</parameter>` elements and
/// from the children of a `<parameters>`-style wrapper.
fn collect_xml_arguments(text: &str) -> Map<String, Value> {
    let mut args = Map::new();

    let mut from = 0;
    while let Some(el) = find_element(text, "parameter", from) {
        from = el.end;
        if let Some(key) = attr_value(el.attrs, "name") {
            args.insert(key, Value::String(el.inner.trim().to_string()));
        }
    }

    for tag in XML_ARGUMENT_ELEMENTS {
        if let Some(el) = find_element(text, tag, 0) {
            for (key, value) in child_elements(el.inner) {
                args.entry(key).or_insert(Value::String(value));
            }
        }
    }

    args
}

/// Find the first `<tag …>inner</tag>` at or after `from` (ASCII case-insensitive).
fn find_element<'a>(text: &'a str, tag: &str, from: usize) -> Option<Element<'a>> {
    let lower = text.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");

    let mut search = from;
    while let Some(rel) = lower.get(search..)?.find(&open) {
        let start = search + rel;
        let after_name = start + open.len();
        let next = lower[after_name..].chars().next()?;
        if next == '>' || next.is_whitespace() {
            let gt = after_name + lower[after_name..].find('>')?;
            let inner_start = gt + 1;
            let close_at = inner_start + lower[inner_start..].find(&close)?;
            return Some(Element {
                attrs: &text[after_name..gt],
                inner: &text[inner_start..close_at],
                end: close_at + close.len(),
            });
        }
        search = after_name;
    }
    None
}

/// Read `key="value"` (or single-quoted) from an element's attribute text.
fn attr_value(attrs: &str, key: &str) -> Option<String> {
    let pattern = format!("{key}=");
    let mut search = 0;
    while let Some(rel) = attrs[search..].find(&pattern) {
        let at = search + rel;
        let boundary_ok = at == 0
            || attrs[..at]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace);
        let value_start = at + pattern.len();
        if boundary_ok {
            let rest = &attrs[value_start..];
            let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            let body = &rest[1..];
            let end = body.find(quote)?;
            return Some(body[..end].to_string());
        }
        search = value_start;
    }
    None
}

/// Direct child elements `<key>value</key>` of an element body.
fn child_elements(inner: &str) -> Vec<(String, String)> {
    let mut children = Vec::new();
    let mut pos = 0;

    while let Some(rel) = inner[pos..].find('<') {
        let start = pos + rel + 1;
        let name: String = inner[start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
            .collect();
        if name.is_empty() {
            pos = start;
            continue;
        }
        let Some(gt_rel) = inner[start..].find('>') else {
            break;
        };
        let body_start = start + gt_rel + 1;
        let close = format!("</{name}>");
        match inner[body_start..].find(&close) {
            Some(close_rel) => {
                let value = inner[body_start..body_start + close_rel].trim().to_string();
                children.push((name, value));
                pos = body_start + close_rel + close.len();
            }
            None => pos = body_start,
        }
    }

    children
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ToolCallExtractor {
        ToolCallExtractor::with_timestamp(1_700_000_000_000)
    }

    #[test]
    fn test_parse_native_json_valid() {
        let result =
            parse_native_json_tool_call(Some("call_123"), "list_dir", r#"{"path": "/tmp"}"#)
                .unwrap();

        assert_eq!(result.id, "call_123");
        assert_eq!(result.name, "list_dir");
        assert_eq!(result.arguments["path"], "/tmp");
        assert!(result.result.is_none());
    }

    #[test]
    fn test_parse_native_json_generates_id_and_accepts_empty_args() {
        let result = parse_native_json_tool_call(None, "get_time", "").unwrap();
        assert!(result.id.starts_with("call_"));
        assert!(result.arguments.is_empty());
    }

    #[test]
    fn test_parse_native_json_empty_name() {
        assert!(parse_native_json_tool_call(None, "", "{}").is_err());
    }

    #[test]
    fn test_parse_native_json_invalid_json() {
        let result = parse_native_json_tool_call(None, "test_tool", "not json");
        match result {
            Err(InferenceError::ToolCallParseError { reason, .. }) => {
                assert!(reason.contains("invalid JSON"))
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_json_single_call() {
        let calls = extractor().extract_span(r#"{"tool":"Foo","parameters":{"a":1}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Foo");
        assert_eq!(Value::Object(calls[0].arguments.clone()), serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_json_malformed_yields_nothing() {
        let calls = extractor().extract_span(r#"{"tool":"Foo","parameters":{"a":1}"#);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_json_array_and_aliases() {
        let calls = extractor().extract_span(
            r#"[
                {"name": "first", "args": {"x": true}},
                {"tool": "second", "arguments": {"y": "z"}}
            ]"#,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[0].arguments["x"], true);
        assert_eq!(calls[1].name, "second");
        assert_eq!(calls[1].arguments["y"], "z");
    }

    #[test]
    fn test_json_array_skips_bad_elements() {
        let calls = extractor().extract_span(r#"[{"parameters": {}}, {"tool": "ok"}, 3]"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ok");
    }

    #[test]
    fn test_json_double_encoded_arguments() {
        let calls = extractor()
            .extract_span(r#"{"name":"read_file","arguments":"{\"path\":\"/etc/hosts\"}"}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["path"], "/etc/hosts");
    }

    #[test]
    fn test_json_missing_arguments_is_empty_object() {
        let calls = extractor().extract_span(r#"{"tool":"get_time"}"#);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].arguments.is_empty());
    }

    #[test]
    fn test_json_non_object_arguments_rejected() {
        let calls = extractor().extract_span(r#"{"tool":"x","parameters":[1,2]}"#);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_json_in_code_fence() {
        let calls = extractor().extract_span("\n```json\n{\"tool\":\"fenced\"}\n```\n");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "fenced");
    }

    #[test]
    fn test_synthesized_ids_are_unique_in_batch() {
        let mut ex = extractor();
        let mut calls = ex.extract_span(r#"[{"tool":"a"},{"tool":"a"}]"#);
        calls.extend(ex.extract_span(r#"{"tool":"a"}"#));

        assert_eq!(calls[0].id, "a_0_1700000000000");
        assert_eq!(calls[1].id, "a_1_1700000000000");
        assert_eq!(calls[2].id, "a_2_1700000000000");
    }

    #[test]
    fn test_model_ids_kept_unless_repeated() {
        let mut ex = extractor();
        let calls = ex.extract_span(r#"[{"id":"c1","tool":"a"},{"id":"c1","tool":"b"}]"#);
        assert_eq!(calls[0].id, "c1");
        assert_ne!(calls[1].id, "c1");
        assert_eq!(calls[1].id, "b_1_1700000000000");
    }

    #[test]
    fn test_admitted_ids_are_not_reused() {
        let mut ex = extractor();
        let native = ex.admit(ToolCall::new("native_1", "n", Map::new()));
        assert_eq!(native.id, "native_1");

        let calls = ex.extract_span(r#"{"id":"native_1","tool":"a"}"#);
        assert_eq!(calls[0].id, "a_1_1700000000000");
    }

    #[test]
    fn test_admit_resynthesizes_repeated_native_ids() {
        let mut ex = extractor();
        let first = ex.admit(ToolCall::new("call_0", "a", Map::new()));
        let second = ex.admit(ToolCall::new("call_0", "b", Map::new()));
        let blank = ex.admit(ToolCall::new("", "c", Map::new()));

        assert_eq!(first.id, "call_0");
        assert_eq!(second.id, "b_1_1700000000000");
        assert_eq!(blank.id, "c_2_1700000000000");
        assert_eq!(second.name, "b");
    }

    #[test]
    fn test_xml_nested_parameters() {
        let calls = extractor().extract_span(
            "<name>read_file</name>\n<parameters>\n  <path>/tmp/a.txt</path>\n  <limit>10</limit>\n</parameters>",
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "/tmp/a.txt");
        assert_eq!(calls[0].arguments["limit"], "10");
    }

    #[test]
    fn test_xml_parameter_attributes() {
        let calls = extractor().extract_span(
            r#"<tool_name>search</tool_name><parameter name="query">rust async</parameter><parameter name='limit'>5</parameter>"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments["query"], "rust async");
        assert_eq!(calls[0].arguments["limit"], "5");
    }

    #[test]
    fn test_xml_invoke_blocks() {
        let calls = extractor().extract_span(
            r#"<invoke name="a"><parameter name="x">1</parameter></invoke>
               <invoke name="b"></invoke>"#,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[0].arguments["x"], "1");
        assert_eq!(calls[1].name, "b");
        assert!(calls[1].arguments.is_empty());
    }

    #[test]
    fn test_plain_prose_span_yields_nothing() {
        assert!(extractor().extract_span("I would call a tool here").is_empty());
        assert!(!parses_as_tool_call("I would call a tool here"));
    }

    #[test]
    fn test_extract_tool_calls_from_text() {
        let (content, calls) = extract_tool_calls(
            "Let me look.\n<ToolCall>{\"tool\":\"ls\",\"parameters\":{\"path\":\".\"}}</ToolCall>\n\
             <ToolCall>{broken</ToolCall>",
        );
        assert_eq!(content, "Let me look.\n\n");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ls");
    }

    #[test]
    fn test_attr_value_requires_boundary() {
        assert_eq!(attr_value(r#" tool_name="x" name="y""#, "name").as_deref(), Some("y"));
        assert_eq!(attr_value(r#" name="only""#, "name").as_deref(), Some("only"));
        assert!(attr_value(r#" id="1""#, "name").is_none());
    }
}
