/// Node definition validation
///
/// Collects every schema violation instead of stopping at the first one, so a node
/// author sees the whole list in a single registration attempt.

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::ValidationIssue;
use crate::node::types::{NodeDefinition, NodeLogic, NodeProperty, PropertyType};

/// Validate a definition whose properties have already been resolved
pub fn validate_definition(definition: &NodeDefinition, properties: &[NodeProperty]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    require_string(&mut issues, "identifier", &definition.identifier);
    require_string(&mut issues, "displayName", &definition.display_name);
    require_string(&mut issues, "name", &definition.name);
    require_string(&mut issues, "description", &definition.description);

    if definition.group.is_empty() {
        issues.push(ValidationIssue::new("group", "must contain at least one group"));
    }
    check_name_array(&mut issues, "group", &definition.group);
    check_name_array(&mut issues, "inputs", &definition.inputs);
    check_name_array(&mut issues, "outputs", &definition.outputs);

    if definition.version < 1 {
        issues.push(ValidationIssue::new("version", "must be an integer >= 1"));
    }

    if let NodeLogic::Script(source) = &definition.logic {
        if source.trim().is_empty() {
            issues.push(ValidationIssue::new("execute", "script source must not be empty"));
        }
    }

    let mut seen = HashSet::new();
    for (index, property) in properties.iter().enumerate() {
        issues.extend(validate_property(index, property));
        if !property.name.is_empty() && !seen.insert(property.name.as_str()) {
            issues.push(ValidationIssue::new(
                format!("properties[{}].name", index),
                format!("duplicate property name '{}'", property.name),
            ));
        }
    }

    issues
}

/// Validate one property schema entry independently of its siblings
pub fn validate_property(index: usize, property: &NodeProperty) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let path = |field: &str| format!("properties[{}].{}", index, field);

    if property.display_name.trim().is_empty() {
        issues.push(ValidationIssue::new(path("displayName"), "is required"));
    }
    if property.name.trim().is_empty() {
        issues.push(ValidationIssue::new(path("name"), "is required"));
    }
    if let PropertyType::Unknown(raw) = &property.property_type {
        issues.push(ValidationIssue::new(
            path("type"),
            format!("unknown property type '{}'", raw),
        ));
    }
    if property.property_type.requires_options()
        && property.options.as_ref().map_or(true, |opts| opts.is_empty())
    {
        issues.push(ValidationIssue::new(
            path("options"),
            format!("is required for type '{}'", property.property_type.as_str()),
        ));
    }

    issues
}

/// Check that every visible required property has a non-empty value
pub fn check_required_parameters(properties: &[NodeProperty], params: &Map<String, Value>) -> Vec<ValidationIssue> {
    properties
        .iter()
        .filter(|prop| prop.required && prop.is_visible(params))
        .filter(|prop| match params.get(&prop.name) {
            None | Some(Value::Null) => prop.default.is_null(),
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .map(|prop| ValidationIssue::new(format!("parameters.{}", prop.name), "is required"))
        .collect()
}

fn require_string(issues: &mut Vec<ValidationIssue>, field: &str, value: &str) {
    if value.trim().is_empty() {
        issues.push(ValidationIssue::new(field, "is required and must be a non-empty string"));
    }
}

fn check_name_array(issues: &mut Vec<ValidationIssue>, field: &str, values: &[String]) {
    for (index, value) in values.iter().enumerate() {
        if value.trim().is_empty() {
            issues.push(ValidationIssue::new(
                format!("{}[{}]", field, index),
                "must be a non-empty string",
            ));
        }
    }
}
