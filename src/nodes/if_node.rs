/// IF node: routes every item to the `true` or `false` branch
///
/// `value1`, `operation` and `value2` are resolved per item, so expressions such as
/// `{{ $json.age }}` compare that item's fields.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::node::types::{
    ExecutionCapability, Item, NodeDefinition, NodeHandler, NodeLogic, NodeProperty, OutputEntry, Properties,
    PropertyOption, PropertyType,
};
use crate::runtime::ExecutionContext;

pub const IDENTIFIER: &str = "nodeward.if";

const OPERATIONS: [(&str, &str); 8] = [
    ("Equal", "equal"),
    ("Not Equal", "notEqual"),
    ("Larger", "larger"),
    ("Smaller", "smaller"),
    ("Contains", "contains"),
    ("Not Contains", "notContains"),
    ("Is Empty", "isEmpty"),
    ("Is Not Empty", "isNotEmpty"),
];

pub fn definition() -> NodeDefinition {
    let mut definition = NodeDefinition::new(IDENTIFIER, "IF", NodeLogic::Host(Arc::new(IfNode)));
    definition.name = "if".to_string();
    definition.group = vec!["logic".to_string()];
    definition.description = "Route items to different branches (true/false)".to_string();
    definition.outputs = vec!["true".to_string(), "false".to_string()];
    definition.node_category = Some(ExecutionCapability::Condition);
    definition.properties = Properties::Static(vec![
        NodeProperty::new("value1", "Value 1", PropertyType::String).with_default(json!("")),
        NodeProperty::new("operation", "Operation", PropertyType::Options)
            .with_default(json!("equal"))
            .with_options(
                OPERATIONS
                    .iter()
                    .map(|(name, value)| PropertyOption {
                        name: name.to_string(),
                        value: json!(value),
                        description: None,
                    })
                    .collect(),
            ),
        NodeProperty::new("value2", "Value 2", PropertyType::String).with_default(json!("")),
    ]);
    definition
}

struct IfNode;

#[async_trait]
impl NodeHandler for IfNode {
    async fn execute(&self, ctx: &ExecutionContext, input: Vec<Item>) -> anyhow::Result<Vec<OutputEntry>> {
        let mut matched = Vec::new();
        let mut unmatched = Vec::new();

        for (index, item) in input.into_iter().enumerate() {
            let value1 = ctx.get_node_parameter("value1", index).await?;
            let value2 = ctx.get_node_parameter("value2", index).await?;
            let operation = ctx.get_node_parameter("operation", index).await?;
            let operation = operation.as_str().unwrap_or("equal");

            if compare(operation, &value1, &value2)? {
                matched.push(item.to_value());
            } else {
                unmatched.push(item.to_value());
            }
        }

        tracing::debug!("🔀 IF routed {} item(s) to true, {} to false", matched.len(), unmatched.len());

        let mut entry = OutputEntry::new();
        entry.insert("true".to_string(), Value::Array(matched));
        entry.insert("false".to_string(), Value::Array(unmatched));
        Ok(vec![entry])
    }
}

fn compare(operation: &str, left: &Value, right: &Value) -> anyhow::Result<bool> {
    let result = match operation {
        "equal" => loosely_equal(left, right),
        "notEqual" => !loosely_equal(left, right),
        "larger" => matches!((as_number(left), as_number(right)), (Some(a), Some(b)) if a > b),
        "smaller" => matches!((as_number(left), as_number(right)), (Some(a), Some(b)) if a < b),
        "contains" => contains(left, right),
        "notContains" => !contains(left, right),
        "isEmpty" => is_empty(left),
        "isNotEmpty" => !is_empty(left),
        other => anyhow::bail!("IF node has unknown operation '{}'", other),
    };
    Ok(result)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numbers compare numerically, everything else by text
fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) if !left.is_boolean() && !right.is_boolean() => a == b,
        _ => as_text(left) == as_text(right),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(values) => values.iter().any(|value| loosely_equal(value, needle)),
        Value::Object(obj) => obj.contains_key(&as_text(needle)),
        other => as_text(other).contains(&as_text(needle)),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(values) => values.is_empty(),
        Value::Object(obj) => obj.is_empty(),
        _ => false,
    }
}
