//! `{{name}}` substitution for prompts, queries and tool arguments.

use serde_json::Value;
use std::collections::HashMap;

/// Replace every `{{key}}` with the variable's value. Strings are inserted
/// raw, other values as compact JSON, missing keys as the empty string.
pub fn render(template: &str, vars: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = vars.get(key) {
                    out.push_str(&display(value));
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render every string leaf of a JSON value.
pub fn render_value(value: &Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            // A lone placeholder keeps the variable's JSON type.
            let trimmed = s.trim();
            if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
                let key = trimmed[2..trimmed.len() - 2].trim();
                if let Some(v) = vars.get(key) {
                    return v.clone();
                }
            }
            Value::String(render(s, vars))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
