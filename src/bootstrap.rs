/// Engine bootstrap
///
/// Wires the registry (with its optional SQLite store), the built-in nodes and the
/// executor together from an `EngineConfig`.

use anyhow::Result;
use std::sync::Arc;

use crate::collaborators::{CredentialService, NoopVariableService, OAuthProviderRegistry, VariableService};
use crate::config::EngineConfig;
use crate::node::{NodeRegistry, SqliteNodeTypeStore};
use crate::nodes::register_builtin_nodes;
use crate::runtime::NodeExecutor;

/// Collaborators supplied by the embedding application
#[derive(Default)]
pub struct Collaborators {
    pub credentials: Option<Arc<dyn CredentialService>>,
    pub oauth: Option<Arc<dyn OAuthProviderRegistry>>,
    pub variables: Option<Arc<dyn VariableService>>,
}

/// Build a ready executor: store (if configured) → registry → built-ins → executor
pub async fn create_executor(config: EngineConfig, collaborators: Collaborators) -> Result<NodeExecutor> {
    tracing::info!("🚀 Initializing node execution engine");

    let registry = match &config.store.database_url {
        Some(url) => {
            tracing::info!("📊 Connecting node-type store: {}", url);
            let store = SqliteNodeTypeStore::connect(url).await?;
            Arc::new(NodeRegistry::with_store(Arc::new(store)))
        }
        None => {
            tracing::info!("📊 No node-type store configured, registry is in-memory only");
            Arc::new(NodeRegistry::new())
        }
    };

    register_builtin_nodes(&registry).await?;

    let variables = collaborators
        .variables
        .unwrap_or_else(|| Arc::new(NoopVariableService));
    let executor = NodeExecutor::with_collaborators(
        registry,
        config,
        collaborators.credentials,
        collaborators.oauth,
        variables,
    )?;

    tracing::info!("✅ Engine initialized with {} node type(s)", executor.registry().len());
    Ok(executor)
}
