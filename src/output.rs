/// Output standardization
///
/// Nodes report results in one of three historical conventions. This module folds
/// all of them into a single `StandardizedOutput` so downstream consumers never need
/// to know which convention a node used.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::node::types::{Item, OutputEntry};

/// Canonical execution result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardizedOutput {
    /// Every produced item; equals the concatenation of all branches when present
    pub main: Vec<Item>,
    /// Branch name → items, in first-production order (serialized as a JSON object)
    #[serde(default, skip_serializing_if = "Option::is_none", with = "branch_map")]
    pub branches: Option<Vec<(String, Vec<Item>)>>,
    pub metadata: OutputMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    pub node_type: String,
    pub output_count: usize,
    pub has_multiple_branches: bool,
}

impl StandardizedOutput {
    /// Items of one branch, if the output has branches
    pub fn branch(&self, name: &str) -> Option<&[Item]> {
        self.branches
            .as_ref()?
            .iter()
            .find(|(branch, _)| branch == name)
            .map(|(_, items)| items.as_slice())
    }

    pub fn branch_names(&self) -> Vec<&str> {
        self.branches
            .as_ref()
            .map(|branches| branches.iter().map(|(name, _)| name.as_str()).collect())
            .unwrap_or_default()
    }
}

mod branch_map {
    use super::Item;
    use serde::{ser::SerializeMap, Deserialize, Deserializer, Serializer};
    use serde_json::{Map, Value};

    pub fn serialize<S: Serializer>(
        branches: &Option<Vec<(String, Vec<Item>)>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match branches {
            None => serializer.serialize_none(),
            Some(list) => {
                let mut map = serializer.serialize_map(Some(list.len()))?;
                for (name, items) in list {
                    map.serialize_entry(name, items)?;
                }
                map.end()
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<(String, Vec<Item>)>>, D::Error> {
        let raw: Option<Map<String, Value>> = Option::deserialize(deserializer)?;
        raw.map(|map| {
            map.into_iter()
                .map(|(name, items)| {
                    serde_json::from_value(items)
                        .map(|items| (name, items))
                        .map_err(serde::de::Error::custom)
                })
                .collect()
        })
        .transpose()
    }
}

/// Build a raw entry with a single `main` port
pub fn main_entry(items: Vec<Item>) -> OutputEntry {
    branch_entry("main", items)
}

/// Build a raw entry for one named port or branch
pub fn branch_entry(name: &str, items: Vec<Item>) -> OutputEntry {
    let mut entry = Map::new();
    entry.insert(
        name.to_string(),
        Value::Array(items.iter().map(Item::to_value).collect()),
    );
    entry
}

/// Normalize anything item-like into items: arrays map element-wise, null is empty
pub fn normalize_items(value: &Value) -> Vec<Item> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(values) => values.iter().cloned().map(Item::from_value).collect(),
        other => vec![Item::from_value(other.clone())],
    }
}

/// Interpret a script's return value as raw per-port entries
///
/// - nil or an empty table: no entries
/// - an array of arrays on a multi-output node: one positional entry per array
/// - an array: the items of a single `main` entry
/// - a table keyed only by declared output names (or `main`) whose values are
///   lists: one named-branch entry
/// - anything else: a single item
pub fn entries_from_script_value(value: Value, outputs: &[String]) -> Vec<OutputEntry> {
    match value {
        Value::Null => Vec::new(),
        Value::Object(obj) if obj.is_empty() => Vec::new(),
        Value::Array(values) => {
            let positional = outputs.len() > 1 && !values.is_empty() && values.iter().all(Value::is_array);
            if positional {
                values.into_iter().map(main_entry_value).collect()
            } else {
                vec![main_entry_value(Value::Array(values))]
            }
        }
        Value::Object(obj) if is_branch_table(&obj, outputs) => {
            let entry = obj
                .into_iter()
                .map(|(name, items)| match items {
                    // An empty Lua table reads back as an object
                    Value::Object(_) => (name, Value::Array(Vec::new())),
                    list => (name, list),
                })
                .collect();
            vec![entry]
        }
        other => vec![main_entry_value(Value::Array(vec![other]))],
    }
}

fn main_entry_value(items: Value) -> OutputEntry {
    let mut entry = Map::new();
    entry.insert("main".to_string(), items);
    entry
}

fn is_branch_table(obj: &Map<String, Value>, outputs: &[String]) -> bool {
    obj.iter().all(|(name, items)| {
        let known = name == "main" || outputs.iter().any(|output| output == name);
        let list = items.is_array() || items.as_object().is_some_and(Map::is_empty);
        known && list
    })
}

/// Classify raw per-port entries and normalize them
///
/// Checked in this order:
/// 1. positional multi-output: more than one declared output and every entry uses
///    only `main` → entry i becomes `outputs[i]` (or `output{i}`)
/// 2. named branches: any entry has a key other than `main`
/// 3. standard single output
pub fn standardize_output(node_type: &str, outputs: &[String], raw: &[OutputEntry]) -> StandardizedOutput {
    let only_main = |entry: &OutputEntry| entry.len() == 1 && entry.contains_key("main");

    if raw.is_empty() {
        return StandardizedOutput {
            main: Vec::new(),
            branches: None,
            metadata: OutputMetadata {
                node_type: node_type.to_string(),
                output_count: outputs.len(),
                has_multiple_branches: false,
            },
        };
    }

    if outputs.len() > 1 && raw.iter().all(only_main) {
        let mut branches: Vec<(String, Vec<Item>)> = Vec::with_capacity(raw.len());
        for (i, entry) in raw.iter().enumerate() {
            let name = outputs.get(i).cloned().unwrap_or_else(|| format!("output{}", i));
            let items = entry.get("main").map(normalize_items).unwrap_or_default();
            push_branch(&mut branches, name, items);
        }
        return with_branches(node_type, outputs, branches);
    }

    if raw.iter().any(|entry| entry.keys().any(|key| key != "main")) {
        let mut branches: Vec<(String, Vec<Item>)> = Vec::new();
        for entry in raw {
            for (key, value) in entry {
                if key == "main" {
                    continue;
                }
                push_branch(&mut branches, key.clone(), normalize_items(value));
            }
        }
        return with_branches(node_type, outputs, branches);
    }

    let main = raw
        .iter()
        .filter_map(|entry| entry.get("main"))
        .flat_map(normalize_items)
        .collect();

    StandardizedOutput {
        main,
        branches: None,
        metadata: OutputMetadata {
            node_type: node_type.to_string(),
            output_count: outputs.len(),
            has_multiple_branches: false,
        },
    }
}

/// Append to an existing branch or open a new one; never overwrites
fn push_branch(branches: &mut Vec<(String, Vec<Item>)>, name: String, items: Vec<Item>) {
    match branches.iter_mut().find(|(existing, _)| *existing == name) {
        Some((_, existing)) => existing.extend(items),
        None => branches.push((name, items)),
    }
}

fn with_branches(node_type: &str, outputs: &[String], branches: Vec<(String, Vec<Item>)>) -> StandardizedOutput {
    let main = branches.iter().flat_map(|(_, items)| items.iter().cloned()).collect();
    StandardizedOutput {
        main,
        metadata: OutputMetadata {
            node_type: node_type.to_string(),
            output_count: outputs.len().max(branches.len()),
            has_multiple_branches: branches.len() > 1,
        },
        branches: Some(branches),
    }
}
