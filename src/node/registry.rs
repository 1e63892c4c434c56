/// Lock-free node registry using ArcSwap
///
/// Every registration swaps the whole map pointer, so executions that already looked
/// up a definition keep running against their snapshot while new ones see the update.
/// The registry is a value owned by the application root and shared through `Arc`.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};

use crate::error::ValidationIssue;
use crate::node::storage::{NodeTypeRecord, NodeTypeStore};
use crate::node::types::{NodeDefinition, NodeLogic, NodeSchema, Properties};
use crate::node::validation::validate_definition;

/// Registry entry: resolved definition plus the externally tracked activation flag
#[derive(Debug, Clone)]
pub struct RegisteredNode {
    pub definition: Arc<NodeDefinition>,
    pub active: bool,
}

/// Outcome of `register_node`; `errors` lists every violation found
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResult {
    pub success: bool,
    pub errors: Vec<ValidationIssue>,
}

pub struct NodeRegistry {
    /// Key: node identifier, Value: registered node
    nodes: ArcSwap<HashMap<String, Arc<RegisteredNode>>>,

    /// Optional persistent store for write-through and cold-start reads
    store: Option<Arc<dyn NodeTypeStore>>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.nodes.load().len())
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Create an in-memory registry without a backing store
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::new(Arc::new(HashMap::new())),
            store: None,
        }
    }

    /// Create a registry that writes through to (and falls back on) `store`
    pub fn with_store(store: Arc<dyn NodeTypeStore>) -> Self {
        Self {
            nodes: ArcSwap::new(Arc::new(HashMap::new())),
            store: Some(store),
        }
    }

    /// Validate and register a node definition
    ///
    /// The properties generator runs once here and the resolved list is what gets
    /// stored. Re-registering an identifier overwrites the definition but keeps its
    /// activation flag.
    pub async fn register_node(&self, definition: NodeDefinition) -> RegistrationResult {
        let properties = definition.properties.resolve();
        let errors = validate_definition(&definition, &properties);

        if !errors.is_empty() {
            tracing::warn!(
                "❌ Refused registration of '{}': {} violation(s)",
                definition.identifier,
                errors.len()
            );
            return RegistrationResult { success: false, errors };
        }

        let identifier = definition.identifier.clone();
        let resolved = Arc::new(NodeDefinition {
            properties: Properties::Static(properties),
            ..definition
        });

        let previous = self.nodes.load().get(&identifier).cloned();
        self.nodes.rcu(|current| {
            let mut next = HashMap::clone(current);
            let active = current.get(&identifier).map(|node| node.active).unwrap_or(true);
            next.insert(
                identifier.clone(),
                Arc::new(RegisteredNode {
                    definition: Arc::clone(&resolved),
                    active,
                }),
            );
            next
        });

        let active = self.is_node_active(&identifier);
        self.persist(&resolved, active, previous.is_some()).await;

        tracing::info!(
            "📦 Registered node type: {} v{} ({})",
            identifier,
            resolved.version,
            if previous.is_some() { "updated" } else { "new" }
        );

        RegistrationResult {
            success: true,
            errors: Vec::new(),
        }
    }

    /// Remove a node type; later lookups and executions fail with "not found"
    pub fn unregister_node(&self, identifier: &str) -> bool {
        let mut removed = false;
        self.nodes.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(identifier).is_some();
            next
        });

        if removed {
            tracing::info!("🗑️ Unregistered node type: {}", identifier);
        }
        removed
    }

    /// Look up a definition, falling back to the store on cold start
    pub async fn get_node_definition(&self, identifier: &str) -> Option<Arc<NodeDefinition>> {
        if let Some(node) = self.nodes.load().get(identifier) {
            return Some(Arc::clone(&node.definition));
        }

        let record = self.cold_start_lookup(identifier).await?;
        let script = record.script?;
        let definition = Arc::new(NodeDefinition::from_schema(record.schema, NodeLogic::Script(script)));

        let active = record.active;
        self.nodes.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.entry(identifier.to_string()).or_insert_with(|| {
                Arc::new(RegisteredNode {
                    definition: Arc::clone(&definition),
                    active,
                })
            });
            next
        });

        tracing::info!("📥 Loaded node type '{}' from store on cold start", identifier);
        Some(definition)
    }

    /// Serializable schema for a node type, falling back to the store on cold start
    pub async fn get_node_schema(&self, identifier: &str) -> Option<NodeSchema> {
        if let Some(node) = self.nodes.load().get(identifier) {
            return Some(node.definition.schema());
        }

        self.cold_start_lookup(identifier).await.map(|record| record.schema)
    }

    /// Registered entry including the activation flag
    pub fn get_registered(&self, identifier: &str) -> Option<Arc<RegisteredNode>> {
        self.nodes.load().get(identifier).cloned()
    }

    /// Flip the externally tracked activation flag
    pub async fn set_node_active(&self, identifier: &str, active: bool) -> bool {
        let mut found = None;
        self.nodes.rcu(|current| {
            let mut next = HashMap::clone(current);
            found = None;
            if let Some(node) = next.get_mut(identifier) {
                *node = Arc::new(RegisteredNode {
                    definition: Arc::clone(&node.definition),
                    active,
                });
                found = Some(Arc::clone(&node.definition));
            }
            next
        });

        match found {
            Some(definition) => {
                self.persist(&definition, active, true).await;
                tracing::info!("🔀 Node type '{}' active = {}", identifier, active);
                true
            }
            None => false,
        }
    }

    pub fn is_node_active(&self, identifier: &str) -> bool {
        self.nodes
            .load()
            .get(identifier)
            .map(|node| node.active)
            .unwrap_or(false)
    }

    /// All registered schemas, sorted by identifier
    pub fn list_nodes(&self) -> Vec<NodeSchema> {
        let mut schemas: Vec<NodeSchema> = self
            .nodes
            .load()
            .values()
            .map(|node| node.definition.schema())
            .collect();
        schemas.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        schemas
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }

    /// Store read used only while the in-memory registry is empty
    async fn cold_start_lookup(&self, identifier: &str) -> Option<NodeTypeRecord> {
        if !self.is_empty() {
            return None;
        }
        let store = self.store.as_ref()?;

        match store.find(identifier).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("❌ Node type store lookup failed for '{}': {}", identifier, e);
                None
            }
        }
    }

    /// Write-through to the store; failures are logged, registration stands
    async fn persist(&self, definition: &NodeDefinition, active: bool, existed: bool) {
        let Some(store) = &self.store else {
            return;
        };

        let record = NodeTypeRecord {
            schema: definition.schema(),
            script: match &definition.logic {
                NodeLogic::Script(source) => Some(source.clone()),
                NodeLogic::Host(_) => None,
            },
            active,
        };

        let result = if existed || store.find(&record.schema.identifier).await.ok().flatten().is_some() {
            store.update(&record).await
        } else {
            store.create(&record).await
        };

        if let Err(e) = result {
            tracing::error!(
                "❌ Failed to persist node type '{}': {}",
                record.schema.identifier,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::storage::SqliteNodeTypeStore;
    use crate::node::types::{NodeProperty, PropertyType};
    use sqlx::sqlite::SqlitePoolOptions;

    fn script_node(identifier: &str) -> NodeDefinition {
        NodeDefinition::new(identifier, "Script Node", NodeLogic::Script("return items".into()))
    }

    fn generated_properties() -> Vec<NodeProperty> {
        vec![NodeProperty::new("field", "Field", PropertyType::String)]
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = NodeRegistry::new();
        let mut def = script_node("test.generated");
        def.properties = Properties::Generator(generated_properties);

        let result = registry.register_node(def).await;
        assert!(result.success);

        let stored = registry.get_node_definition("test.generated").await.unwrap();
        assert!(matches!(stored.properties, Properties::Static(ref list) if list.len() == 1));
    }

    #[tokio::test]
    async fn test_missing_identifier_is_reported() {
        let registry = NodeRegistry::new();
        let result = registry.register_node(script_node("")).await;
        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.property == "identifier"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_preserves_active_flag() {
        let registry = NodeRegistry::new();
        registry.register_node(script_node("test.flag")).await;
        assert!(registry.set_node_active("test.flag", false).await);

        let mut updated = script_node("test.flag");
        updated.version = 2;
        assert!(registry.register_node(updated).await.success);

        assert!(!registry.is_node_active("test.flag"));
        let def = registry.get_node_definition("test.flag").await.unwrap();
        assert_eq!(def.version, 2);
    }

    #[tokio::test]
    async fn test_unregister_removes_entry() {
        let registry = NodeRegistry::new();
        registry.register_node(script_node("test.gone")).await;
        assert!(registry.unregister_node("test.gone"));
        assert!(registry.get_node_definition("test.gone").await.is_none());
        assert!(!registry.unregister_node("test.gone"));
    }

    #[tokio::test]
    async fn test_cold_start_falls_back_to_store() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Arc::new(SqliteNodeTypeStore::new(pool));
        store.init_schema().await.unwrap();

        let warm = NodeRegistry::with_store(store.clone());
        assert!(warm.register_node(script_node("test.persisted")).await.success);

        let cold = NodeRegistry::with_store(store);
        let schema = cold.get_node_schema("test.persisted").await.unwrap();
        assert_eq!(schema.display_name, "Script Node");

        let def = cold.get_node_definition("test.persisted").await.unwrap();
        assert!(matches!(def.logic, NodeLogic::Script(_)));
        assert_eq!(cold.len(), 1);
    }
}
