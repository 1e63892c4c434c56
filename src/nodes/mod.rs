/// Built-in Node Types
///
/// Host-implemented nodes that ship with the engine:
/// - Function: user Lua over all items, in the sandbox
/// - HTTP Request: guarded outbound requests, optionally authenticated
/// - IF: per-item routing to `true`/`false` branches
/// - Split In Batches: positional `loop`/`done` outputs with a cursor in scratch state
/// - Set: write fields onto items

pub mod function;
pub mod http_request;
pub mod if_node;
pub mod set;
pub mod split_in_batches;

use crate::node::types::NodeDefinition;
use crate::node::NodeRegistry;

/// Definitions of every built-in node
pub fn builtin_definitions() -> Vec<NodeDefinition> {
    vec![
        function::definition(),
        http_request::definition(),
        if_node::definition(),
        split_in_batches::definition(),
        set::definition(),
    ]
}

/// Register every built-in node; fails on the first one that does not validate
pub async fn register_builtin_nodes(registry: &NodeRegistry) -> anyhow::Result<()> {
    let definitions = builtin_definitions();
    let count = definitions.len();

    for definition in definitions {
        let identifier = definition.identifier.clone();
        let result = registry.register_node(definition).await;
        if !result.success {
            let issues: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
            anyhow::bail!("Built-in node {} failed validation: {}", identifier, issues.join("; "));
        }
    }

    tracing::info!("🧩 Registered {} built-in node types", count);
    Ok(())
}
