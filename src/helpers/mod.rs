/// Capability-Scoped Helper Surface
///
/// The only doors node logic has to the outside world:
/// - SSRF-guarded HTTP with per-execution concurrency limits
/// - Credential access with OAuth refresh and redaction markers
/// - Per-run scratch state
/// - Sandbox access for host nodes that run user scripts

// Outbound HTTP
pub mod http;

// Credential fetch and OAuth refresh
pub mod credentials;

// Scratch state keyed by execution and node
pub mod state;

pub use credentials::CredentialAccessor;
pub use http::{AuthStrategy, HttpHelper, HttpResponse, RequestGate, RequestOptions};
pub use state::NodeStateStore;

use serde_json::Value;

use crate::error::EngineResult;
use crate::node::types::Item;
use crate::output::normalize_items;
use crate::runtime::ExecutionContext;
use crate::sandbox::SandboxContext;

/// Helpers bound to one execution context
#[derive(Clone, Copy)]
pub struct HelperSurface<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> HelperSurface<'a> {
    pub(crate) fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx }
    }

    /// Outbound request under this execution's limits
    pub async fn request(&self, options: RequestOptions) -> EngineResult<HttpResponse> {
        let services = self.ctx.services();
        services
            .http
            .request(&self.ctx.meta().execution_id, self.ctx.limits(), options)
            .await
    }

    /// Outbound request authenticated with the node's credential of `credential_type`
    pub async fn request_with_authentication(
        &self,
        credential_type: &str,
        options: RequestOptions,
    ) -> EngineResult<HttpResponse> {
        let secret = self.ctx.get_credentials(credential_type).await?;
        let auth = AuthStrategy::from_credential(credential_type, &secret)?;
        tracing::debug!("🔐 Authenticated request using {} credential", credential_type);

        self.ctx
            .services()
            .http
            .request_with_auth(&self.ctx.meta().execution_id, self.ctx.limits(), options, &auth)
            .await
    }

    /// Wrap every element as an item's `json`, even if it already looks wrapped
    pub fn return_json_array(&self, value: Value) -> Vec<Item> {
        let wrap = |value: Value| match value {
            Value::Object(obj) => Item::new(obj),
            other => Item::from_value(other),
        };
        match value {
            Value::Array(values) => values.into_iter().map(wrap).collect(),
            Value::Null => Vec::new(),
            other => vec![wrap(other)],
        }
    }

    /// Accept wrapped items, plain objects or scalars
    pub fn normalize_items(&self, value: &Value) -> Vec<Item> {
        normalize_items(value)
    }

    /// Run a Lua script in the sandbox under this execution's limits
    pub async fn run_script(&self, code: &str, context: &SandboxContext) -> EngineResult<Value> {
        self.ctx
            .services()
            .isolates
            .execute_in_sandbox(code, context, self.ctx.limits())
            .await
    }
}
