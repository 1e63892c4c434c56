/// Set node: writes fields onto every item
///
/// `values` is an object of field name → value, resolved per item. With
/// `dotNotation` a name like `address.city` writes a nested field. With
/// `keepOnlySet` the original fields are dropped.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::node::types::{
    Item, LoadOptions, NodeDefinition, NodeHandler, NodeLogic, NodeProperty, OutputEntry, Properties, PropertyOption,
    PropertyType,
};
use crate::output::main_entry;
use crate::runtime::ExecutionContext;

pub const IDENTIFIER: &str = "nodeward.set";

pub fn definition() -> NodeDefinition {
    let mut definition = NodeDefinition::new(IDENTIFIER, "Set", NodeLogic::Host(Arc::new(SetNode)));
    definition.name = "set".to_string();
    definition.description = "Set values on items and optionally remove other values".to_string();
    definition.properties = Properties::Static(vec![
        NodeProperty::new("values", "Values to Set", PropertyType::Json).with_default(json!({})),
        NodeProperty::new("keepOnlySet", "Keep Only Set", PropertyType::Boolean).with_default(json!(false)),
        NodeProperty::new("dotNotation", "Dot Notation", PropertyType::Boolean).with_default(json!(true)),
    ]);
    definition.load_options = Some(Arc::new(SetOptions));
    definition
}

struct SetNode;

#[async_trait]
impl NodeHandler for SetNode {
    async fn execute(&self, ctx: &ExecutionContext, input: Vec<Item>) -> anyhow::Result<Vec<OutputEntry>> {
        let keep_only_set = ctx.get_node_parameter("keepOnlySet", 0).await?.as_bool().unwrap_or(false);
        let dot_notation = ctx.get_node_parameter("dotNotation", 0).await?.as_bool().unwrap_or(true);

        let mut items = Vec::with_capacity(input.len());
        for (index, item) in input.into_iter().enumerate() {
            let values = match ctx.get_node_parameter("values", index).await? {
                Value::Object(values) => values,
                Value::Null => Map::new(),
                other => anyhow::bail!("Set node 'values' must be an object, got {}", other),
            };

            let mut json = if keep_only_set { Map::new() } else { item.json };
            for (name, value) in values {
                if dot_notation && name.contains('.') {
                    set_path(&mut json, &name, value);
                } else {
                    json.insert(name, value);
                }
            }

            let mut out = Item::new(json);
            out.paired_item = Some(json!(index));
            items.push(out);
        }

        Ok(vec![main_entry(items)])
    }
}

/// Write `value` at a dotted path, replacing non-object intermediates
fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = target;

    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
}

/// `inputFields`: the distinct top-level field names of the current input
struct SetOptions;

#[async_trait]
impl LoadOptions for SetOptions {
    async fn load_options(&self, method: &str, ctx: &ExecutionContext) -> anyhow::Result<Vec<PropertyOption>> {
        if method != "inputFields" {
            anyhow::bail!("Set node has no option loader '{}'", method);
        }

        let mut names: Vec<String> = Vec::new();
        for item in ctx.get_input_data(None) {
            for key in item.json.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }

        Ok(names
            .into_iter()
            .map(|name| PropertyOption {
                value: json!(name),
                name,
                description: None,
            })
            .collect())
    }
}
