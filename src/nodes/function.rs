/// Function node: runs user Lua over all input items in the sandbox
///
/// The script sees `items` (wrapped items), `parameters`, `execution` and `state`,
/// and returns the new items: an array of records or wrapped items, a single
/// record, or nil for no output.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::node::types::{Item, NodeDefinition, NodeHandler, NodeLogic, NodeProperty, OutputEntry, Properties, PropertyType};
use crate::output::main_entry;
use crate::runtime::ExecutionContext;
use crate::sandbox::SandboxContext;

pub const IDENTIFIER: &str = "nodeward.function";

pub fn definition() -> NodeDefinition {
    let mut definition = NodeDefinition::new(IDENTIFIER, "Function", NodeLogic::Host(Arc::new(FunctionNode)));
    definition.name = "function".to_string();
    definition.description = "Run custom Lua code over all items".to_string();
    definition.properties = Properties::Generator(properties);
    definition
}

fn properties() -> Vec<NodeProperty> {
    vec![NodeProperty::new("functionCode", "Lua Code", PropertyType::String)
        .required()
        .verbatim()
        .with_default(json!("return items"))]
}

struct FunctionNode;

#[async_trait]
impl NodeHandler for FunctionNode {
    async fn execute(&self, ctx: &ExecutionContext, input: Vec<Item>) -> anyhow::Result<Vec<OutputEntry>> {
        let code = ctx.get_node_parameter("functionCode", 0).await?;
        let code = code
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Function node 'functionCode' must be a string"))?;

        tracing::debug!("🧠 Running function code over {} item(s)", input.len());

        let mut context = SandboxContext::new();
        context.insert(
            "items".to_string(),
            Value::Array(input.iter().map(Item::to_value).collect()),
        );
        context.insert("parameters".to_string(), Value::Object(ctx.parameters().clone()));
        context.insert("execution".to_string(), serde_json::to_value(ctx.meta())?);
        context.insert("state".to_string(), ctx.get_node_state());

        let result = ctx.helpers().run_script(code, &context).await?;

        let items = match result {
            Value::Object(obj) if obj.is_empty() => Vec::new(),
            other => ctx.helpers().normalize_items(&other),
        };
        ctx.logger().debug(&format!("function produced {} item(s)", items.len()));

        Ok(vec![main_entry(items)])
    }
}
