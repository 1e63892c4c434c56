/// External collaborators consumed by the engine
///
/// Credential storage, variable substitution and OAuth providers live outside this
/// crate. The engine only sees these traits; tests and embedders supply the
/// implementations.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::node::storage::NodeTypeStore;

/// Decrypted credential store
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Decrypted secret fields for `credential_id`, scoped to the executing user
    async fn get_credential_for_execution(&self, credential_id: &str, user_id: &str) -> Result<Map<String, Value>>;

    /// Merge `patch` into the stored secret
    async fn update_credential(&self, credential_id: &str, user_id: &str, patch: Map<String, Value>) -> Result<()>;
}

/// `$vars` / `$local` substitution
#[async_trait]
pub trait VariableService: Send + Sync {
    async fn replace_variables_in_text(&self, text: &str, user_id: &str, workflow_id: &str) -> Result<String>;
}

/// Tokens returned by a successful refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    /// Providers that rotate refresh tokens return a new one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the new access token in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// OAuth providers able to refresh access tokens
#[async_trait]
pub trait OAuthProviderRegistry: Send + Sync {
    async fn refresh_access_token(
        &self,
        provider: &str,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<OAuthTokens>;
}

/// Variable service that leaves text untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVariableService;

#[async_trait]
impl VariableService for NoopVariableService {
    async fn replace_variables_in_text(&self, text: &str, _user_id: &str, _workflow_id: &str) -> Result<String> {
        Ok(text.to_string())
    }
}
