//! `<tool_trace>` blocks in agent output.
//!
//! Agents backed by a text-producing process may list the tools they used as
//! a JSON array inside `<tool_trace>...</tool_trace>` in their answer. The
//! coordinator turns each entry into tool events under that agent.

use serde_json::{Map, Value};

const OPEN: &str = "<tool_trace>";
const CLOSE: &str = "</tool_trace>";
const UNKNOWN_TOOL: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct TracedTool {
    pub tool: String,
    pub server: String,
    pub args: Map<String, Value>,
    /// `{result, count}` when the entry reported either.
    pub result: Option<Value>,
}

impl TracedTool {
    fn from_entry(entry: &Map<String, Value>) -> Self {
        let tool = entry
            .get("tool")
            .and_then(Value::as_str)
            .filter(|tool| !tool.trim().is_empty())
            .unwrap_or(UNKNOWN_TOOL)
            .to_owned();
        let args = match entry.get("args") {
            Some(Value::Object(args)) => args.clone(),
            _ => entry
                .iter()
                .filter(|(key, _)| !matches!(key.as_str(), "tool" | "result" | "result_count"))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };
        let server = if tool.to_lowercase().contains("arango") {
            "arangodb"
        } else {
            "mcp"
        };
        let result = entry.get("result").filter(|v| is_truthy(v));
        let count = entry.get("result_count").filter(|v| is_truthy(v));
        let result = (result.is_some() || count.is_some()).then(|| {
            serde_json::json!({
                "result": result.cloned().unwrap_or(Value::Null),
                "count": count.cloned().unwrap_or(Value::Null),
            })
        });
        Self {
            tool,
            server: server.to_owned(),
            args,
            result,
        }
    }

    /// AQL text carried in the arguments, if any.
    pub fn query(&self) -> Option<&str> {
        self.args
            .get("query")
            .and_then(Value::as_str)
            .filter(|query| !query.is_empty())
    }
}

/// Find the first trace block in `text`. Returns the trimmed raw block (the
/// identity used to process a block only once) and its entries. Blocks that
/// are not a JSON array are ignored.
pub fn extract_tool_trace(text: &str) -> Option<(String, Vec<TracedTool>)> {
    let lowered = text.to_ascii_lowercase();
    let start = lowered.find(OPEN)? + OPEN.len();
    let end = start + lowered[start..].find(CLOSE)?;
    let raw = text[start..end].trim();
    let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(raw) else {
        return None;
    };
    let tools = entries
        .iter()
        .filter_map(Value::as_object)
        .map(TracedTool::from_entry)
        .collect();
    Some((raw.to_owned(), tools))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
