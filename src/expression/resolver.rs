/// Parameter resolution
///
/// Parameters are resolved once per call: variables are substituted through the
/// `VariableService`, then every `{{ }}` placeholder is evaluated against item 0.
/// The substituted parameters are kept so a node can re-resolve one of them against
/// another item index later.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use crate::collaborators::VariableService;
use crate::config::ExecutionLimits;
use crate::error::{EngineError, EngineResult};
use crate::expression::reference::Reference;
use crate::expression::template::{has_placeholder, is_bare_literal, split_template, whole_expression, Segment};
use crate::node::types::Item;
use crate::sandbox::IsolateManager;

/// Ceiling for a single expression evaluation
const EXPRESSION_TIMEOUT_MS: u64 = 1_000;
const EXPRESSION_MEMORY_LIMIT: usize = 32 * 1024 * 1024;

/// Identity of the run a node executes in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionMeta {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub node_id: String,
    pub node_name: String,
    pub run_index: u32,
}

/// Data an expression may reference
#[derive(Debug, Clone, Default)]
pub struct ResolveScope {
    /// Items on the node's main input
    pub items: Vec<Item>,
    /// Output items of upstream nodes, keyed by node name
    pub node_outputs: HashMap<String, Vec<Item>>,
    pub meta: ExecutionMeta,
}

impl ResolveScope {
    /// JSON document that `$` references and Lua globals are drawn from
    pub fn document(&self, item_index: usize, parameters: &Map<String, Value>) -> Value {
        let current = self.items.get(item_index);

        let nodes: Map<String, Value> = self
            .node_outputs
            .iter()
            .map(|(name, items)| {
                let paired = items.get(item_index).or_else(|| items.first());
                (
                    name.clone(),
                    json!({
                        "json": paired.map(|item| Value::Object(item.json.clone())).unwrap_or_else(|| json!({})),
                        "items": items.iter().map(Item::to_value).collect::<Vec<_>>(),
                    }),
                )
            })
            .collect();

        json!({
            "json": current.map(|item| Value::Object(item.json.clone())).unwrap_or_else(|| json!({})),
            "node": nodes,
            "input": {
                "item": current.map(Item::to_value).unwrap_or(Value::Null),
                "all": self.items.iter().map(Item::to_value).collect::<Vec<_>>(),
                "first": self.items.first().map(Item::to_value).unwrap_or(Value::Null),
                "last": self.items.last().map(Item::to_value).unwrap_or(Value::Null),
            },
            "execution": {"id": self.meta.execution_id},
            "workflow": {"id": self.meta.workflow_id},
            "itemIndex": item_index,
            "runIndex": self.meta.run_index,
            "parameter": parameters,
        })
    }
}

/// Evaluates placeholders inside parameter values
///
/// Built for one call, with that call's limits clamped to the expression ceiling.
#[derive(Debug, Clone)]
pub struct ExpressionEvaluator {
    isolates: IsolateManager,
    limits: ExecutionLimits,
}

impl ExpressionEvaluator {
    pub fn new(isolates: IsolateManager, limits: &ExecutionLimits) -> Self {
        let limits = ExecutionLimits {
            timeout_ms: limits.timeout_ms.min(EXPRESSION_TIMEOUT_MS),
            memory_limit: limits.memory_limit.min(EXPRESSION_MEMORY_LIMIT),
            ..*limits
        };
        Self { isolates, limits }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Resolve every placeholder inside `value`, recursing into arrays and objects
    pub fn evaluate<'a>(
        &'a self,
        value: &'a Value,
        document: &'a Value,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Value>> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::String(text) => self.evaluate_string(text, document).await,
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.evaluate(item, document).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(obj) => {
                    let mut out = Map::with_capacity(obj.len());
                    for (key, child) in obj {
                        out.insert(key.clone(), self.evaluate(child, document).await?);
                    }
                    Ok(Value::Object(out))
                }
                other => Ok(other.clone()),
            }
        })
    }

    async fn evaluate_string(&self, text: &str, document: &Value) -> EngineResult<Value> {
        if let Some(body) = whole_expression(text) {
            if is_bare_literal(body) {
                return Ok(Value::String(body.to_string()));
            }
            return self.evaluate_expression(body, document).await;
        }

        if !has_placeholder(text) {
            return Ok(Value::String(text.to_string()));
        }

        let mut out = String::with_capacity(text.len());
        for segment in split_template(text) {
            match segment {
                Segment::Text(literal) => out.push_str(literal),
                Segment::Expr(body) => out.push_str(&value_to_text(&self.evaluate_expression(body, document).await?)),
            }
        }
        Ok(Value::String(out))
    }

    /// Pure references go through JSONPath; anything else runs as Lua on the blocking pool
    pub async fn evaluate_expression(&self, body: &str, document: &Value) -> EngineResult<Value> {
        if let Some(reference) = Reference::parse(body) {
            return Ok(reference.select(document));
        }

        let code = format!("return {}", strip_dollars(body));
        let context = document.as_object().cloned().unwrap_or_default();
        tracing::debug!("🧮 Evaluating expression: {}", body);

        self.isolates
            .execute_in_sandbox(&code, &context, &self.limits)
            .await
            .map_err(|e| match e {
                EngineError::SandboxExecution(message) => {
                    EngineError::Expression(format!("'{}' failed: {}", body, message))
                }
                other => other,
            })
    }
}

/// `$json.a` → `json.a`; a `$` not followed by an identifier, or inside a quoted
/// string, is left alone
fn strip_dollars(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(open) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == open {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '$' if chars.peek().is_some_and(|next| next.is_alphabetic() || *next == '_') => continue,
            _ => {}
        }
        out.push(c);
    }
    out
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parameters after variable substitution and item-0 evaluation
#[derive(Debug, Clone)]
pub struct ResolvedParameters {
    substituted: Map<String, Value>,
    resolved: Map<String, Value>,
    /// Names passed through untouched
    verbatim: Vec<String>,
    scope: Arc<ResolveScope>,
    evaluator: ExpressionEvaluator,
}

impl ResolvedParameters {
    /// Value resolved against item 0
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.resolved.get(name)
    }

    pub fn all(&self) -> &Map<String, Value> {
        &self.resolved
    }

    pub fn scope(&self) -> &ResolveScope {
        &self.scope
    }

    /// Re-resolve one parameter against `item_index`; unknown names are null
    pub async fn resolve_for_item(&self, name: &str, item_index: usize) -> EngineResult<Value> {
        if item_index == 0 || self.verbatim.iter().any(|v| v == name) {
            return Ok(self.resolved.get(name).cloned().unwrap_or(Value::Null));
        }
        let Some(raw) = self.substituted.get(name) else {
            return Ok(Value::Null);
        };
        let document = self.scope.document(item_index, &self.substituted);
        self.evaluator.evaluate(raw, &document).await
    }
}

/// Turns raw node parameters into `ResolvedParameters`
#[derive(Clone)]
pub struct ParameterResolver {
    variables: Arc<dyn VariableService>,
    isolates: IsolateManager,
}

impl std::fmt::Debug for ParameterResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterResolver")
            .field("isolates", &self.isolates)
            .finish()
    }
}

impl ParameterResolver {
    pub fn new(variables: Arc<dyn VariableService>, isolates: IsolateManager) -> Self {
        Self { variables, isolates }
    }

    /// Substitute variables once, then evaluate every parameter for item 0
    pub async fn resolve(
        &self,
        raw: &Map<String, Value>,
        scope: ResolveScope,
        limits: &ExecutionLimits,
    ) -> EngineResult<ResolvedParameters> {
        self.resolve_except(raw, scope, &[], limits).await
    }

    /// Like `resolve`, but parameters named in `verbatim` skip substitution and evaluation
    ///
    /// Used for properties such as script source, where `{{` is ordinary syntax.
    /// Expressions run under the call's `limits`, clamped to the expression ceiling.
    pub async fn resolve_except(
        &self,
        raw: &Map<String, Value>,
        scope: ResolveScope,
        verbatim: &[String],
        limits: &ExecutionLimits,
    ) -> EngineResult<ResolvedParameters> {
        let is_verbatim = |name: &str| verbatim.iter().any(|v| v == name);
        let evaluator = ExpressionEvaluator::new(self.isolates.clone(), limits);

        let mut substituted = Map::with_capacity(raw.len());
        for (name, value) in raw {
            let value = if is_verbatim(name) {
                value.clone()
            } else {
                self.substitute_variables(value, &scope.meta).await?
            };
            substituted.insert(name.clone(), value);
        }

        let document = scope.document(0, &substituted);
        let mut resolved = Map::with_capacity(substituted.len());
        for (name, value) in &substituted {
            let value = if is_verbatim(name) {
                value.clone()
            } else {
                evaluator.evaluate(value, &document).await?
            };
            resolved.insert(name.clone(), value);
        }

        tracing::debug!("🎯 Resolved {} parameter(s) for node {}", resolved.len(), scope.meta.node_name);

        Ok(ResolvedParameters {
            substituted,
            resolved,
            verbatim: verbatim.to_vec(),
            scope: Arc::new(scope),
            evaluator,
        })
    }

    fn substitute_variables<'a>(
        &'a self,
        value: &'a Value,
        meta: &'a ExecutionMeta,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Value>> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::String(text) if text.contains("$vars") || text.contains("$local") => self
                    .variables
                    .replace_variables_in_text(text, &meta.user_id, &meta.workflow_id)
                    .await
                    .map(Value::String)
                    .map_err(|e| EngineError::Expression(format!("variable substitution failed: {}", e))),
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.substitute_variables(item, meta).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(obj) => {
                    let mut out = Map::with_capacity(obj.len());
                    for (key, child) in obj {
                        out.insert(key.clone(), self.substitute_variables(child, meta).await?);
                    }
                    Ok(Value::Object(out))
                }
                other => Ok(other.clone()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoopVariableService;
    use crate::error::ErrorKind;
    use async_trait::async_trait;

    struct FixedVariables;

    #[async_trait]
    impl VariableService for FixedVariables {
        async fn replace_variables_in_text(&self, text: &str, _user_id: &str, _workflow_id: &str) -> anyhow::Result<String> {
            Ok(text.replace("$vars.region", "eu-west").replace("$local.token", "t0k"))
        }
    }

    fn item(value: Value) -> Item {
        Item::from_value(value)
    }

    fn scope() -> ResolveScope {
        ResolveScope {
            items: vec![item(json!({"name": "Ada", "age": 36})), item(json!({"name": "Linus", "age": 54}))],
            node_outputs: HashMap::from([("Lookup".to_string(), vec![item(json!({"id": 7}))])]),
            meta: ExecutionMeta {
                execution_id: "exec-9".into(),
                workflow_id: "wf-1".into(),
                ..ExecutionMeta::default()
            },
        }
    }

    fn resolver(variables: Arc<dyn VariableService>) -> ParameterResolver {
        ParameterResolver::new(variables, IsolateManager::new())
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits::default()
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_resolves_references_expressions_and_text() {
        let raw = params(json!({
            "name": "{{ $json.name }}",
            "age": "{{ $json.age }}",
            "next": "{{ $json.age + 1 }}",
            "greeting": "Hello {{ $json.name }} from {{ $node[\"Lookup\"].json.id }}",
            "literal": "{{ hello }}",
            "exec": "{{ $execution.id }}",
            "nested": {"list": ["{{ $json.name }}", 3]},
            "plain": "no placeholders"
        }));

        let resolved = resolver(Arc::new(NoopVariableService)).resolve(&raw, scope(), &limits()).await.unwrap();

        assert_eq!(resolved.get("name"), Some(&json!("Ada")));
        assert_eq!(resolved.get("age"), Some(&json!(36)));
        assert_eq!(resolved.get("next"), Some(&json!(37)));
        assert_eq!(resolved.get("greeting"), Some(&json!("Hello Ada from 7")));
        assert_eq!(resolved.get("literal"), Some(&json!("hello")));
        assert_eq!(resolved.get("exec"), Some(&json!("exec-9")));
        assert_eq!(resolved.get("nested"), Some(&json!({"list": ["Ada", 3]})));
        assert_eq!(resolved.get("plain"), Some(&json!("no placeholders")));
    }

    #[tokio::test]
    async fn test_resolve_for_item_uses_that_item() {
        let raw = params(json!({"name": "{{ $json.name }}", "idx": "{{ $itemIndex }}"}));
        let resolved = resolver(Arc::new(NoopVariableService)).resolve(&raw, scope(), &limits()).await.unwrap();

        assert_eq!(resolved.resolve_for_item("name", 1).await.unwrap(), json!("Linus"));
        assert_eq!(resolved.resolve_for_item("idx", 1).await.unwrap(), json!(1));
        assert_eq!(resolved.resolve_for_item("name", 0).await.unwrap(), json!("Ada"));
        assert_eq!(resolved.resolve_for_item("missing", 1).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_variables_are_substituted_before_expressions() {
        let raw = params(json!({"url": "https://{{ $json.name }}.$vars.region.example.com", "auth": ["$local.token"]}));
        let resolved = resolver(Arc::new(FixedVariables)).resolve(&raw, scope(), &limits()).await.unwrap();

        assert_eq!(resolved.get("url"), Some(&json!("https://Ada.eu-west.example.com")));
        assert_eq!(resolved.get("auth"), Some(&json!(["t0k"])));
    }

    #[tokio::test]
    async fn test_missing_reference_is_null_and_bad_expression_fails() {
        let resolver = resolver(Arc::new(NoopVariableService));
        let resolved = resolver
            .resolve(&params(json!({"gone": "{{ $json.nope }}"})), scope(), &limits())
            .await
            .unwrap();
        assert_eq!(resolved.get("gone"), Some(&Value::Null));

        let err = resolver
            .resolve(&params(json!({"bad": "{{ $json.name .. }}"})), scope(), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expression);
    }

    #[tokio::test]
    async fn test_verbatim_parameters_are_left_alone() {
        let raw = params(json!({"code": "return {{a = 1}}", "name": "{{ $json.name }}"}));
        let resolved = resolver(Arc::new(NoopVariableService))
            .resolve_except(&raw, scope(), &["code".to_string()], &limits())
            .await
            .unwrap();

        assert_eq!(resolved.get("code"), Some(&json!("return {{a = 1}}")));
        assert_eq!(resolved.resolve_for_item("code", 1).await.unwrap(), json!("return {{a = 1}}"));
        assert_eq!(resolved.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn test_strip_dollars() {
        assert_eq!(strip_dollars("$json.a + $node[\"x\"].json.b"), "json.a + node[\"x\"].json.b");
        assert_eq!(strip_dollars("cost $ 5"), "cost $ 5");
        assert_eq!(strip_dollars("'$json' .. $json.a"), "'$json' .. json.a");
        assert_eq!(strip_dollars("\"it\\\"s $x\" .. $x"), "\"it\\\"s $x\" .. x");
    }

    #[tokio::test]
    async fn test_dollars_inside_quotes_survive_evaluation() {
        let raw = params(json!({"label": "{{ '$json' .. 'x' }}", "mixed": "{{ \"$\" .. $json.name }}"}));
        let resolved = resolver(Arc::new(NoopVariableService)).resolve(&raw, scope(), &limits()).await.unwrap();

        assert_eq!(resolved.get("label"), Some(&json!("$jsonx")));
        assert_eq!(resolved.get("mixed"), Some(&json!("$Ada")));
    }

    #[tokio::test]
    async fn test_runaway_expression_hits_the_expression_deadline() {
        let isolates = IsolateManager::new();
        let resolver = ParameterResolver::new(Arc::new(NoopVariableService), isolates.clone());
        let raw = params(json!({"spin": "{{ (function() while true do end end)() }}"}));

        let started = std::time::Instant::now();
        let err = resolver.resolve(&raw, scope(), &limits()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SandboxTimeout);
        assert!(started.elapsed() < std::time::Duration::from_millis(1900));
        assert_eq!(isolates.live_isolates(), 0);
    }

    #[tokio::test]
    async fn test_greedy_expression_hits_the_memory_ceiling() {
        let raw = params(json!({
            "hog": "{{ (function() local t = {} for i = 1, 1e8 do t[i] = i end return #t end)() }}"
        }));
        let err = resolver(Arc::new(NoopVariableService))
            .resolve(&raw, scope(), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxMemory);
    }

    #[tokio::test]
    async fn test_expression_limits_follow_the_call() {
        let tight = ExecutionLimits {
            timeout_ms: 100,
            ..ExecutionLimits::default()
        };
        let raw = params(json!({"spin": "{{ (function() while true do end end)() }}"}));

        let started = std::time::Instant::now();
        let err = resolver(Arc::new(NoopVariableService))
            .resolve(&raw, scope(), &tight)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SandboxTimeout);
        assert!(started.elapsed() < std::time::Duration::from_millis(900));
        assert_eq!(ExpressionEvaluator::new(IsolateManager::new(), &tight).limits().timeout_ms, 100);
        assert_eq!(
            ExpressionEvaluator::new(IsolateManager::new(), &limits()).limits().memory_limit,
            EXPRESSION_MEMORY_LIMIT.min(limits().memory_limit)
        );
    }

    #[tokio::test]
    async fn test_pattern_bomb_in_a_parameter_is_refused() {
        let isolates = IsolateManager::new();
        let resolver = ParameterResolver::new(Arc::new(NoopVariableService), isolates.clone());
        let raw = params(json!({"bomb": "{{ string.find(string.rep('a', 20000), '.-.-.-b') }}"}));

        let err = resolver.resolve(&raw, scope(), &limits()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
        assert_eq!(isolates.live_isolates(), 0);
    }
}
