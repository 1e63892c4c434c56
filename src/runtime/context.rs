/// Per-call execution context handed to node logic
///
/// Created fresh for every `execute_node` call and dropped when the call ends.
/// Everything node logic may touch is reached through here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ExecutionLimits;
use crate::error::{EngineError, EngineResult};
use crate::expression::{ExecutionMeta, ResolvedParameters};
use crate::helpers::{CredentialAccessor, HelperSurface, HttpHelper, NodeStateStore};
use crate::node::types::{Item, NodeDefinition};
use crate::sandbox::IsolateManager;

/// Run-level flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSettings {
    /// Turn a failure into an error item instead of stopping the run
    pub continue_on_fail: bool,
    /// Emit data even when the node failed
    pub always_output_data: bool,
}

/// Long-lived services shared by every execution
#[derive(Debug)]
pub struct ExecutionServices {
    pub http: HttpHelper,
    pub isolates: IsolateManager,
    pub credentials: Option<CredentialAccessor>,
    pub state: NodeStateStore,
}

/// Node-facing logger; forwards to `tracing` with node and execution fields
#[derive(Debug, Clone)]
pub struct NodeLogger {
    node_type: String,
    execution_id: String,
}

impl NodeLogger {
    pub fn new(node_type: &str, execution_id: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            execution_id: execution_id.to_string(),
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(node_type = %self.node_type, execution_id = %self.execution_id, "📝 {}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(node_type = %self.node_type, execution_id = %self.execution_id, "📝 {}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(node_type = %self.node_type, execution_id = %self.execution_id, "⚠️ {}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(node_type = %self.node_type, execution_id = %self.execution_id, "❌ {}", message);
    }
}

pub struct ExecutionContext {
    node: Arc<NodeDefinition>,
    parameters: ResolvedParameters,
    /// Sanitized input, port name → items
    inputs: HashMap<String, Vec<Item>>,
    credential_refs: HashMap<String, String>,
    limits: ExecutionLimits,
    settings: RunSettings,
    services: Arc<ExecutionServices>,
    logger: NodeLogger,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("node", &self.node.identifier)
            .field("meta", self.meta())
            .field("limits", &self.limits)
            .field("settings", &self.settings)
            .finish()
    }
}

impl ExecutionContext {
    pub(crate) fn new(
        node: Arc<NodeDefinition>,
        parameters: ResolvedParameters,
        inputs: HashMap<String, Vec<Item>>,
        credential_refs: HashMap<String, String>,
        limits: ExecutionLimits,
        settings: RunSettings,
        services: Arc<ExecutionServices>,
    ) -> Self {
        let logger = NodeLogger::new(&node.identifier, &parameters.scope().meta.execution_id);
        Self {
            node,
            parameters,
            inputs,
            credential_refs,
            limits,
            settings,
            services,
            logger,
        }
    }

    /// Parameter resolved against `item_index` (item 0 is pre-resolved)
    pub async fn get_node_parameter(&self, name: &str, item_index: usize) -> EngineResult<Value> {
        self.parameters.resolve_for_item(name, item_index).await
    }

    /// All parameters as resolved for item 0
    pub fn parameters(&self) -> &Map<String, Value> {
        self.parameters.all()
    }

    /// Decrypted secret for one of the node's credential types
    pub async fn get_credentials(&self, credential_type: &str) -> EngineResult<Map<String, Value>> {
        let accessor = self
            .services
            .credentials
            .as_ref()
            .ok_or_else(|| EngineError::Credential("no credential service configured".to_string()))?;
        accessor
            .get_credentials(credential_type, &self.credential_refs, &self.meta().user_id)
            .await
    }

    /// Items on `port`, or on `main` when no port is given
    pub fn get_input_data(&self, port: Option<&str>) -> Vec<Item> {
        self.inputs
            .get(port.unwrap_or("main"))
            .cloned()
            .unwrap_or_default()
    }

    pub fn helpers(&self) -> HelperSurface<'_> {
        HelperSurface::new(self)
    }

    pub fn logger(&self) -> &NodeLogger {
        &self.logger
    }

    pub fn get_node_state(&self) -> Value {
        let meta = self.meta();
        self.services.state.get(&meta.execution_id, &meta.node_id)
    }

    pub fn set_node_state(&self, state: Value) {
        let meta = self.meta();
        self.services.state.set(&meta.execution_id, &meta.node_id, state);
    }

    /// Drop this node's scratch state
    pub fn clear_node_state(&self) {
        let meta = self.meta();
        self.services.state.remove(&meta.execution_id, &meta.node_id);
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn node(&self) -> &NodeDefinition {
        &self.node
    }

    pub fn meta(&self) -> &ExecutionMeta {
        &self.parameters.scope().meta
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub(crate) fn services(&self) -> &ExecutionServices {
        &self.services
    }
}
