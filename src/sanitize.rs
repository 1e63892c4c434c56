/// Input/output sanitization
///
/// Data crossing into or out of node logic is untrusted whether or not it ran in the
/// sandbox. Both directions get the same deep strip of prototype-pollution keys;
/// presence of such keys is reported as a warning and never blocks execution.

use serde::Serialize;
use serde_json::{Map, Value};

/// Keys removed at every nesting level
pub const DANGEROUS_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Result of validating one side of an execution
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Paths of stripped dangerous keys
    pub warnings: Vec<String>,
    /// Populated only when `valid`
    pub sanitized_data: Option<Value>,
}

/// Validate node input: must be an object (port name → items)
pub fn validate_input_data(data: &Value) -> ValidationReport {
    if !data.is_object() {
        return invalid(format!("Input data must be an object, got {}", type_name(data)));
    }
    sanitized_report(data)
}

/// Validate node output: must be an array of per-port entries
pub fn validate_output_data(data: &Value) -> ValidationReport {
    if !data.is_array() {
        return invalid(format!("Output data must be an array, got {}", type_name(data)));
    }
    sanitized_report(data)
}

/// Deep copy of `value` without dangerous keys
pub fn sanitize(value: &Value) -> Value {
    let mut removed = Vec::new();
    strip(value, "$", &mut removed)
}

fn sanitized_report(data: &Value) -> ValidationReport {
    let mut removed = Vec::new();
    let sanitized = strip(data, "$", &mut removed);

    if !removed.is_empty() {
        tracing::warn!("🧹 Stripped {} dangerous key(s): {:?}", removed.len(), removed);
    }

    ValidationReport {
        valid: true,
        errors: Vec::new(),
        warnings: removed
            .into_iter()
            .map(|path| format!("Removed dangerous key at {}", path))
            .collect(),
        sanitized_data: Some(sanitized),
    }
}

fn invalid(error: String) -> ValidationReport {
    ValidationReport {
        valid: false,
        errors: vec![error],
        warnings: Vec::new(),
        sanitized_data: None,
    }
}

fn strip(value: &Value, path: &str, removed: &mut Vec<String>) -> Value {
    match value {
        Value::Object(obj) => {
            let mut clean = Map::with_capacity(obj.len());
            for (key, child) in obj {
                let child_path = format!("{}.{}", path, key);
                if DANGEROUS_KEYS.contains(&key.as_str()) {
                    removed.push(child_path);
                    continue;
                }
                clean.insert(key.clone(), strip(child, &child_path, removed));
            }
            Value::Object(clean)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, child)| strip(child, &format!("{}[{}]", path, i), removed))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
