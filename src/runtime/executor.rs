/// Node executor: one node, one call, one normalized result
///
/// `execute_node` runs the whole pipeline for a single node:
/// registry lookup → input sanitization → parameter resolution → node logic
/// (sandboxed script or host handler) → output sanitization → size check →
/// output standardization. Every failure comes back as an `ExecutionOutcome`
/// with `success: false` and a typed error kind.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::collaborators::{CredentialService, NoopVariableService, OAuthProviderRegistry, VariableService};
use crate::config::{EngineConfig, ExecutionLimits, LimitsOverride};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::expression::{ExecutionMeta, ParameterResolver, ResolveScope};
use crate::helpers::{CredentialAccessor, HttpHelper, NodeStateStore};
use crate::node::types::{Item, NodeDefinition, NodeHandler, NodeLogic, OutputEntry, PropertyOption};
use crate::node::validation::check_required_parameters;
use crate::node::NodeRegistry;
use crate::output::{entries_from_script_value, main_entry, normalize_items, standardize_output, StandardizedOutput};
use crate::runtime::context::{ExecutionContext, ExecutionServices, RunSettings};
use crate::sandbox::{IsolateManager, SandboxContext};
use crate::sanitize::{sanitize, validate_input_data, validate_output_data};

/// Everything needed to run one node once
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteNodeRequest {
    /// Registry identifier of the node type
    pub node_type: String,
    /// Raw parameters, possibly containing `{{ }}` placeholders
    pub parameters: Map<String, Value>,
    /// Port name → items; must be a JSON object
    pub input: Value,
    /// Output items of upstream nodes by node name, for `$node[...]` references
    pub node_outputs: HashMap<String, Vec<Item>>,
    /// Credential type → credential id
    pub credentials: HashMap<String, String>,
    pub meta: ExecutionMeta,
    pub settings: RunSettings,
    pub limits: LimitsOverride,
}

impl ExecuteNodeRequest {
    pub fn new(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            input: Value::Object(Map::new()),
            ..Self::default()
        }
    }

    /// Put `items` on the `main` input port
    pub fn with_main_input(mut self, items: Vec<Value>) -> Self {
        let mut input = match self.input {
            Value::Object(obj) => obj,
            _ => Map::new(),
        };
        input.insert("main".to_string(), Value::Array(items));
        self.input = Value::Object(input);
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters.as_object().cloned().unwrap_or_default();
        self
    }
}

/// Typed failure carried by an outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of `execute_node`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Present on success, or on failure with `continueOnFail` + `alwaysOutputData`
    pub data: Option<StandardizedOutput>,
    pub error: Option<ExecutionFailure>,
    /// Sanitizer findings and deadline overruns
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// Per-call state assembled before node logic runs
struct Prepared {
    definition: Arc<NodeDefinition>,
    context: ExecutionContext,
    inputs: HashMap<String, Vec<Item>>,
    limits: ExecutionLimits,
}

pub struct NodeExecutor {
    registry: Arc<NodeRegistry>,
    resolver: ParameterResolver,
    services: Arc<ExecutionServices>,
    config: EngineConfig,
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl NodeExecutor {
    /// Executor without credential or variable services
    pub fn new(registry: Arc<NodeRegistry>, config: EngineConfig) -> anyhow::Result<Self> {
        Self::with_collaborators(registry, config, None, None, Arc::new(NoopVariableService))
    }

    pub fn with_collaborators(
        registry: Arc<NodeRegistry>,
        config: EngineConfig,
        credentials: Option<Arc<dyn CredentialService>>,
        oauth: Option<Arc<dyn OAuthProviderRegistry>>,
        variables: Arc<dyn VariableService>,
    ) -> anyhow::Result<Self> {
        let isolates = IsolateManager::new();
        let services = Arc::new(ExecutionServices {
            http: HttpHelper::new(config.http.clone())?,
            isolates: isolates.clone(),
            credentials: credentials.map(|service| CredentialAccessor::new(service, oauth)),
            state: NodeStateStore::new(),
        });
        let resolver = ParameterResolver::new(variables, isolates);

        tracing::info!(
            "⚙️ Node executor ready (timeout {} ms, memory {} bytes, internal URLs {})",
            config.limits.timeout_ms,
            config.limits.memory_limit,
            if config.http.allow_internal_urls { "allowed" } else { "blocked" }
        );

        Ok(Self {
            registry,
            resolver,
            services,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn isolates(&self) -> &IsolateManager {
        &self.services.isolates
    }

    pub fn state(&self) -> &NodeStateStore {
        &self.services.state
    }

    pub fn http(&self) -> &HttpHelper {
        &self.services.http
    }

    /// Run one node and normalize its output; never panics on node failure
    pub async fn execute_node(&self, mut request: ExecuteNodeRequest) -> ExecutionOutcome {
        let started = Instant::now();
        let mut warnings = Vec::new();

        // Anonymous calls must not share request budgets or scratch state
        if request.meta.execution_id.is_empty() {
            request.meta.execution_id = uuid::Uuid::new_v4().to_string();
        }

        tracing::info!(
            "🚀 Starting node execution: {} (execution: {})",
            request.node_type,
            request.meta.execution_id
        );

        let result = self.run(&request, &mut warnings).await;
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        match result {
            Ok(output) => {
                tracing::info!(
                    "✅ Node execution completed: {} in {:?} ({} items)",
                    request.node_type,
                    duration,
                    output.main.len()
                );
                ExecutionOutcome {
                    success: true,
                    data: Some(output),
                    error: None,
                    warnings,
                    duration_ms,
                }
            }
            Err(err) => {
                tracing::error!(
                    node_type = %request.node_type,
                    execution_id = %request.meta.execution_id,
                    kind = ?err.kind(),
                    "❌ Node execution failed in {:?} - Error: {:#}",
                    duration,
                    err
                );

                let message = err.to_string();
                let data = if request.settings.continue_on_fail && request.settings.always_output_data {
                    Some(self.error_output(&request.node_type, &message).await)
                } else {
                    None
                };

                ExecutionOutcome {
                    success: false,
                    data,
                    error: Some(ExecutionFailure {
                        kind: err.kind(),
                        message,
                    }),
                    warnings,
                    duration_ms,
                }
            }
        }
    }

    /// Ask a node's load-options provider for the values of an options property
    pub async fn load_options(&self, request: ExecuteNodeRequest, method: &str) -> EngineResult<Vec<PropertyOption>> {
        let mut warnings = Vec::new();
        let prepared = self.prepare(&request, &mut warnings).await?;
        let provider = prepared.definition.load_options.clone().ok_or_else(|| {
            EngineError::InvalidData(format!("node type {} has no load-options provider", request.node_type))
        })?;

        tracing::debug!("📋 Loading options '{}' for {}", method, request.node_type);
        provider
            .load_options(method, &prepared.context)
            .await
            .map_err(EngineError::from_anyhow)
    }

    async fn run(&self, request: &ExecuteNodeRequest, warnings: &mut Vec<String>) -> EngineResult<StandardizedOutput> {
        let prepared = self.prepare(request, warnings).await?;
        let definition = Arc::clone(&prepared.definition);

        let raw = match &definition.logic {
            NodeLogic::Host(handler) => self.run_host(handler.as_ref(), &prepared, warnings).await?,
            NodeLogic::Script(code) => self.run_script(code, &prepared).await?,
        };

        let report = validate_output_data(&Value::Array(raw.into_iter().map(Value::Object).collect()));
        if !report.valid {
            return Err(EngineError::InvalidData(report.errors.join("; ")));
        }
        warnings.extend(report.warnings);
        let sanitized = report.sanitized_data.unwrap_or(Value::Array(Vec::new()));

        let size = serde_json::to_vec(&sanitized).map(|bytes| bytes.len()).unwrap_or(usize::MAX);
        if size > prepared.limits.max_output_size {
            return Err(EngineError::ResourceLimit(format!(
                "node output is {} bytes, limit is {} bytes",
                size, prepared.limits.max_output_size
            )));
        }

        let entries: Vec<OutputEntry> = match sanitized {
            Value::Array(values) => values
                .into_iter()
                .map(|value| match value {
                    Value::Object(entry) => entry,
                    other => main_entry(normalize_items(&other)),
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(standardize_output(&definition.identifier, &definition.outputs, &entries))
    }

    async fn prepare(&self, request: &ExecuteNodeRequest, warnings: &mut Vec<String>) -> EngineResult<Prepared> {
        let definition = self
            .registry
            .get_node_definition(&request.node_type)
            .await
            .ok_or_else(|| EngineError::NodeNotFound(request.node_type.clone()))?;

        if !self.registry.is_node_active(&request.node_type) {
            return Err(EngineError::InvalidData(format!(
                "node type {} is inactive",
                request.node_type
            )));
        }

        let limits = self.config.limits.merge(&request.limits);

        // A missing input is an empty port map
        let report = match &request.input {
            Value::Null => validate_input_data(&Value::Object(Map::new())),
            input => validate_input_data(input),
        };
        if !report.valid {
            return Err(EngineError::InvalidData(report.errors.join("; ")));
        }
        warnings.extend(report.warnings);

        let inputs: HashMap<String, Vec<Item>> = match report.sanitized_data {
            Some(Value::Object(ports)) => ports
                .into_iter()
                .map(|(port, items)| (port, normalize_items(&items)))
                .collect(),
            _ => HashMap::new(),
        };

        let properties = definition.resolved_properties();
        let mut parameters = request.parameters.clone();
        for property in &properties {
            if !parameters.contains_key(&property.name) && !property.default.is_null() {
                parameters.insert(property.name.clone(), property.default.clone());
            }
        }

        let missing = check_required_parameters(&properties, &parameters);
        if !missing.is_empty() {
            return Err(EngineError::Validation(missing));
        }

        let node_outputs = request
            .node_outputs
            .iter()
            .map(|(name, items)| {
                let clean = items
                    .iter()
                    .map(|item| Item::from_value(sanitize(&item.to_value())))
                    .collect();
                (name.clone(), clean)
            })
            .collect();

        let scope = ResolveScope {
            items: inputs.get("main").cloned().unwrap_or_default(),
            node_outputs,
            meta: request.meta.clone(),
        };
        let verbatim: Vec<String> = properties
            .iter()
            .filter(|property| property.no_data_expression)
            .map(|property| property.name.clone())
            .collect();
        let resolved = self
            .resolver
            .resolve_except(&parameters, scope, &verbatim, &limits)
            .await?;

        let context = ExecutionContext::new(
            Arc::clone(&definition),
            resolved,
            inputs.clone(),
            request.credentials.clone(),
            limits,
            request.settings,
            Arc::clone(&self.services),
        );

        Ok(Prepared {
            definition,
            context,
            inputs,
            limits,
        })
    }

    /// Host logic is not preempted; overrunning the deadline only warns
    async fn run_host(
        &self,
        handler: &dyn NodeHandler,
        prepared: &Prepared,
        warnings: &mut Vec<String>,
    ) -> EngineResult<Vec<OutputEntry>> {
        let items = prepared.context.get_input_data(None);
        let started = Instant::now();

        let result = handler
            .execute(&prepared.context, items)
            .await
            .map_err(EngineError::from_anyhow);

        let elapsed = started.elapsed();
        if elapsed > prepared.limits.timeout() {
            let message = format!(
                "host node {} ran {} ms, past its {} ms deadline",
                prepared.definition.identifier,
                elapsed.as_millis(),
                prepared.limits.timeout_ms
            );
            tracing::warn!("⏰ {}", message);
            warnings.push(message);
        }

        result
    }

    /// Script logic runs in a fresh isolate with the call's data as globals
    async fn run_script(&self, code: &str, prepared: &Prepared) -> EngineResult<Vec<OutputEntry>> {
        let context = script_context(prepared);
        let value = self
            .services
            .isolates
            .execute_in_sandbox(code, &context, &prepared.limits)
            .await?;
        Ok(entries_from_script_value(value, &prepared.definition.outputs))
    }

    async fn error_output(&self, node_type: &str, message: &str) -> StandardizedOutput {
        let outputs = match self.registry.get_node_definition(node_type).await {
            Some(definition) => definition.outputs.clone(),
            None => vec!["main".to_string()],
        };

        let mut json = Map::new();
        json.insert("error".to_string(), Value::String(message.to_string()));
        let entry = main_entry(vec![Item::new(json)]);

        // The error item always lands on main, even for multi-output nodes
        let mut output = standardize_output(node_type, &["main".to_string()], &[entry]);
        output.metadata.output_count = outputs.len();
        output
    }
}

/// Globals a node script sees: `items`, `inputs`, `parameters`, `execution`, `state`
fn script_context(prepared: &Prepared) -> SandboxContext {
    let ctx = &prepared.context;
    let meta = ctx.meta();
    let items_value = |items: &[Item]| Value::Array(items.iter().map(Item::to_value).collect());

    let mut context = SandboxContext::new();
    context.insert("items".to_string(), items_value(&ctx.get_input_data(None)));
    context.insert(
        "inputs".to_string(),
        Value::Object(
            prepared
                .inputs
                .iter()
                .map(|(port, items)| (port.clone(), items_value(items)))
                .collect(),
        ),
    );
    context.insert("parameters".to_string(), Value::Object(ctx.parameters().clone()));
    context.insert(
        "execution".to_string(),
        serde_json::to_value(meta).unwrap_or(Value::Null),
    );
    context.insert("state".to_string(), ctx.get_node_state());
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpPolicyConfig, StoreConfig};
    use crate::node::types::{NodeProperty, PropertyType};
    use async_trait::async_trait;
    use serde_json::json;

    fn config() -> EngineConfig {
        EngineConfig {
            limits: ExecutionLimits {
                timeout_ms: 300,
                memory_limit: 16 * 1024 * 1024,
                max_output_size: 64 * 1024,
                max_request_timeout_ms: 1_000,
                max_concurrent_requests: 2,
            },
            http: HttpPolicyConfig {
                allow_internal_urls: false,
                user_agent: "nodeward-test".to_string(),
                denied_domains: Vec::new(),
            },
            store: StoreConfig { database_url: None },
        }
    }

    async fn executor_with(definition: NodeDefinition) -> NodeExecutor {
        let registry = Arc::new(NodeRegistry::new());
        assert!(registry.register_node(definition).await.success);
        NodeExecutor::new(registry, config()).unwrap()
    }

    struct Echo;

    #[async_trait]
    impl NodeHandler for Echo {
        async fn execute(&self, ctx: &ExecutionContext, input: Vec<Item>) -> anyhow::Result<Vec<OutputEntry>> {
            let mut items = Vec::new();
            for (index, mut item) in input.into_iter().enumerate() {
                item.json.insert("label".to_string(), ctx.get_node_parameter("label", index).await?);
                items.push(item);
            }
            Ok(vec![main_entry(items)])
        }
    }

    struct Failing;

    #[async_trait]
    impl NodeHandler for Failing {
        async fn execute(&self, _ctx: &ExecutionContext, _input: Vec<Item>) -> anyhow::Result<Vec<OutputEntry>> {
            anyhow::bail!("upstream exploded")
        }
    }

    #[tokio::test]
    async fn test_host_node_resolves_per_item_and_sanitizes() {
        let executor = executor_with(NodeDefinition::new("test.echo", "Echo", NodeLogic::Host(Arc::new(Echo)))).await;

        let request = ExecuteNodeRequest::new("test.echo")
            .with_main_input(vec![json!({"name": "a", "__proto__": {"x": 1}}), json!({"name": "b"})])
            .with_parameters(json!({"label": "{{ $json.name }}!"}));
        let outcome = executor.execute_node(request).await;

        assert!(outcome.success, "{:?}", outcome.error);
        let data = outcome.data.unwrap();
        assert_eq!(data.main[0].json["label"], json!("a!"));
        assert_eq!(data.main[1].json["label"], json!("b!"));
        assert!(data.main[0].json.get("__proto__").is_none());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_script_node_runs_in_sandbox() {
        let definition = NodeDefinition::new(
            "test.double",
            "Double",
            NodeLogic::Script(
                "local out = {} for i, item in ipairs(items) do out[i] = { n = item.json.n * parameters.factor } end return out".into(),
            ),
        );
        let executor = executor_with(definition).await;

        let request = ExecuteNodeRequest::new("test.double")
            .with_main_input(vec![json!({"n": 2}), json!({"n": 5})])
            .with_parameters(json!({"factor": 3}));
        let outcome = executor.execute_node(request).await;

        assert!(outcome.success, "{:?}", outcome.error);
        let main = outcome.data.unwrap().main;
        assert_eq!(main[0].json["n"], json!(6));
        assert_eq!(main[1].json["n"], json!(15));
        assert_eq!(executor.isolates().live_isolates(), 0);
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found() {
        let executor = executor_with(NodeDefinition::new("test.echo", "Echo", NodeLogic::Host(Arc::new(Echo)))).await;
        let outcome = executor.execute_node(ExecuteNodeRequest::new("test.missing")).await;

        assert!(!outcome.success);
        assert!(outcome.data.is_none());
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_continue_on_fail_emits_error_item() {
        let executor = executor_with(NodeDefinition::new("test.fail", "Fail", NodeLogic::Host(Arc::new(Failing)))).await;

        let mut request = ExecuteNodeRequest::new("test.fail");
        request.settings = RunSettings {
            continue_on_fail: true,
            always_output_data: true,
        };
        let outcome = executor.execute_node(request).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind, ErrorKind::Node);
        let data = outcome.data.unwrap();
        assert_eq!(data.main.len(), 1);
        assert_eq!(data.main[0].json["error"], json!("upstream exploded"));
    }

    #[tokio::test]
    async fn test_continue_on_fail_alone_emits_nothing() {
        let executor = executor_with(NodeDefinition::new("test.fail", "Fail", NodeLogic::Host(Arc::new(Failing)))).await;

        let mut request = ExecuteNodeRequest::new("test.fail");
        request.settings.continue_on_fail = true;
        let outcome = executor.execute_node(request).await;

        assert!(!outcome.success);
        assert!(outcome.data.is_none());
    }

    #[tokio::test]
    async fn test_required_parameters_and_input_shape() {
        let mut definition = NodeDefinition::new("test.needs", "Needs", NodeLogic::Host(Arc::new(Echo)));
        definition.properties = crate::node::types::Properties::Static(vec![
            NodeProperty::new("label", "Label", PropertyType::String).required(),
        ]);
        let executor = executor_with(definition).await;

        let outcome = executor.execute_node(ExecuteNodeRequest::new("test.needs")).await;
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Validation);

        let mut request = ExecuteNodeRequest::new("test.needs").with_parameters(json!({"label": "x"}));
        request.input = json!([1, 2]);
        let outcome = executor.execute_node(request).await;
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_anonymous_calls_get_their_own_execution_id() {
        let definition = NodeDefinition::new(
            "test.whoami",
            "Who Am I",
            NodeLogic::Script("return { { id = execution.executionId } }".into()),
        );
        let executor = executor_with(definition).await;

        let first = executor.execute_node(ExecuteNodeRequest::new("test.whoami")).await.data.unwrap();
        let second = executor.execute_node(ExecuteNodeRequest::new("test.whoami")).await.data.unwrap();

        let id = |output: &StandardizedOutput| output.main[0].json["id"].as_str().unwrap_or_default().to_string();
        assert_eq!(id(&first).len(), 36);
        assert_ne!(id(&first), id(&second));
    }

    #[tokio::test]
    async fn test_inactive_node_refuses_execution() {
        let executor = executor_with(NodeDefinition::new("test.echo", "Echo", NodeLogic::Host(Arc::new(Echo)))).await;
        executor.registry().set_node_active("test.echo", false).await;

        let outcome = executor.execute_node(ExecuteNodeRequest::new("test.echo")).await;
        assert!(!outcome.success);
    }
}
