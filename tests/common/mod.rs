#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, StatusCode},
    response::Redirect,
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nodeward::collaborators::{CredentialService, NoopVariableService, OAuthProviderRegistry, OAuthTokens};
use nodeward::config::{EngineConfig, ExecutionLimits, HttpPolicyConfig, StoreConfig};
use nodeward::nodes::register_builtin_nodes;
use nodeward::{NodeExecutor, NodeRegistry};

pub fn config(allow_internal_urls: bool) -> EngineConfig {
    EngineConfig {
        limits: ExecutionLimits {
            timeout_ms: 2_000,
            memory_limit: 32 * 1024 * 1024,
            max_output_size: 256 * 1024,
            max_request_timeout_ms: 5_000,
            max_concurrent_requests: 2,
        },
        http: HttpPolicyConfig {
            allow_internal_urls,
            user_agent: "nodeward-tests".to_string(),
            denied_domains: Vec::new(),
        },
        store: StoreConfig { database_url: None },
    }
}

/// Executor with the built-in nodes and optional credential collaborators
pub async fn executor(
    allow_internal_urls: bool,
    credentials: Option<Arc<dyn CredentialService>>,
    oauth: Option<Arc<dyn OAuthProviderRegistry>>,
) -> NodeExecutor {
    let registry = Arc::new(NodeRegistry::new());
    register_builtin_nodes(&registry).await.unwrap();
    NodeExecutor::with_collaborators(
        registry,
        config(allow_internal_urls),
        credentials,
        oauth,
        Arc::new(NoopVariableService),
    )
    .unwrap()
}

/// Local HTTP server for helper tests
pub async fn spawn_mock_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let by_name = format!("http://localhost:{}/json", addr.port());

    let app = Router::new()
        .route("/json", get(|| async { Json(json!({"hello": "world"})) }))
        .route("/list", get(|| async { Json(json!([{"id": 1}, {"id": 2}, {"id": 3}])) }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Json(json!({"slow": true}))
            }),
        )
        .route(
            "/headers",
            get(|headers: HeaderMap| async move {
                let seen: Map<String, Value> = headers
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
                    })
                    .collect();
                Json(Value::Object(seen))
            }),
        )
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
        .route("/big", get(|| async { "x".repeat(512 * 1024) }))
        .route(
            "/redirect",
            get(move || {
                let target = by_name.clone();
                async move { Redirect::temporary(&target) }
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// In-memory credential service that counts updates
#[derive(Default)]
pub struct MemoryCredentials {
    pub secrets: tokio::sync::Mutex<HashMap<String, Map<String, Value>>>,
    pub updates: AtomicUsize,
}

impl MemoryCredentials {
    pub async fn insert(&self, id: &str, secret: Value) {
        self.secrets
            .lock()
            .await
            .insert(id.to_string(), secret.as_object().cloned().unwrap_or_default());
    }

    pub async fn get(&self, id: &str) -> Map<String, Value> {
        self.secrets.lock().await.get(id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CredentialService for MemoryCredentials {
    async fn get_credential_for_execution(&self, id: &str, _user_id: &str) -> anyhow::Result<Map<String, Value>> {
        self.secrets
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no credential {}", id))
    }

    async fn update_credential(&self, id: &str, _user_id: &str, patch: Map<String, Value>) -> anyhow::Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut secrets = self.secrets.lock().await;
        let secret = secrets.entry(id.to_string()).or_default();
        for (key, value) in patch {
            secret.insert(key, value);
        }
        Ok(())
    }
}

/// OAuth provider that hands out numbered tokens, or always fails
#[derive(Default)]
pub struct CountingProvider {
    pub calls: AtomicUsize,
    pub fail: bool,
}

#[async_trait]
impl OAuthProviderRegistry for CountingProvider {
    async fn refresh_access_token(
        &self,
        _provider: &str,
        _refresh_token: &str,
        _client_id: &str,
        _client_secret: &str,
    ) -> anyhow::Result<OAuthTokens> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.fail {
            anyhow::bail!("provider unavailable");
        }
        Ok(OAuthTokens {
            access_token: format!("fresh-{}", call),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}
