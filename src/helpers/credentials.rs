/// Credential access for node logic
///
/// Node definitions reference credentials by type name; the run supplies which
/// credential id backs each type. Secrets are fetched decrypted from the
/// `CredentialService`, OAuth tokens close to expiry are refreshed first, and the
/// returned map carries `<field>_sanitized` markers for log-safe display.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::collaborators::{CredentialService, OAuthProviderRegistry, OAuthTokens};
use crate::error::{EngineError, EngineResult};

/// Field-name fragments that mark a value as sensitive
pub const SENSITIVE_MARKERS: [&str; 5] = ["password", "secret", "key", "token", "private"];

pub const REDACTED: &str = "[REDACTED]";

/// Tokens expiring within this window are refreshed before use
pub const REFRESH_BUFFER_SECS: i64 = 5 * 60;

/// Add `<field>_sanitized: "[REDACTED]"` next to every sensitive field, at every depth
///
/// Real values stay in place; only the markers are added.
pub fn add_redaction_markers(secret: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(secret.len());
    for (name, value) in secret {
        let child = match value {
            Value::Object(obj) => Value::Object(add_redaction_markers(obj)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Value::Object(obj) => Value::Object(add_redaction_markers(obj)),
                        other => other.clone(),
                    })
                    .collect(),
            ),
            other => other.clone(),
        };
        out.insert(name.clone(), child);

        if is_sensitive(name) && !name.ends_with("_sanitized") {
            out.insert(format!("{}_sanitized", name), Value::String(REDACTED.to_string()));
        }
    }
    out
}

fn is_sensitive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Where an OAuth secret keeps its tokens
///
/// The same three layouts `AuthStrategy` reads bearer tokens from: snake_case at the
/// top level, camelCase at the top level, or snake_case under `oauthTokenData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape {
    Snake,
    Camel,
    Nested,
}

impl TokenShape {
    pub fn detect(secret: &Map<String, Value>) -> Option<Self> {
        let has_pair = |map: &Map<String, Value>, access: &str, refresh: &str| {
            map.get(access).is_some_and(Value::is_string) && map.get(refresh).is_some_and(Value::is_string)
        };
        if has_pair(secret, "access_token", "refresh_token") {
            Some(Self::Snake)
        } else if has_pair(secret, "accessToken", "refreshToken") {
            Some(Self::Camel)
        } else if secret
            .get("oauthTokenData")
            .and_then(Value::as_object)
            .is_some_and(|data| has_pair(data, "access_token", "refresh_token"))
        {
            Some(Self::Nested)
        } else {
            None
        }
    }

    /// Map holding the token fields
    fn tokens<'a>(&self, secret: &'a Map<String, Value>) -> Option<&'a Map<String, Value>> {
        match self {
            Self::Nested => secret.get("oauthTokenData").and_then(Value::as_object),
            _ => Some(secret),
        }
    }

    fn access_key(&self) -> &'static str {
        match self {
            Self::Camel => "accessToken",
            _ => "access_token",
        }
    }

    fn refresh_key(&self) -> &'static str {
        match self {
            Self::Camel => "refreshToken",
            _ => "refresh_token",
        }
    }

    /// Expiry as absolute time, then as epoch milliseconds
    fn expiry_keys(&self) -> [&'static str; 2] {
        match self {
            Self::Camel => ["expiresAt", "expiryDate"],
            _ => ["expires_at", "expiry_date"],
        }
    }

    /// Patch that replaces the tokens in `current` with `tokens`
    ///
    /// Without `expires_in` the expiry is cleared, so the token is not treated as
    /// due again on the next read.
    fn patch(&self, current: &Map<String, Value>, tokens: OAuthTokens) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(self.access_key().to_string(), Value::String(tokens.access_token));
        if let Some(refresh_token) = tokens.refresh_token {
            fields.insert(self.refresh_key().to_string(), Value::String(refresh_token));
        }

        let [at_key, date_key] = self.expiry_keys();
        match tokens.expires_in {
            Some(expires_in) => {
                let expires_at = Utc::now() + chrono::Duration::seconds(expires_in);
                fields.insert(at_key.to_string(), Value::String(expires_at.to_rfc3339()));
                if self.tokens(current).is_some_and(|map| map.contains_key(date_key)) {
                    fields.insert(date_key.to_string(), Value::from(expires_at.timestamp_millis()));
                }
            }
            None => {
                fields.insert(at_key.to_string(), Value::Null);
                fields.insert(date_key.to_string(), Value::Null);
            }
        }

        match self {
            Self::Nested => {
                let mut data = self.tokens(current).cloned().unwrap_or_default();
                data.extend(fields);
                let mut patch = Map::new();
                patch.insert("oauthTokenData".to_string(), Value::Object(data));
                patch
            }
            _ => fields,
        }
    }
}

/// Expiry of an OAuth-shaped secret
///
/// Accepts an absolute expiry as RFC 3339 text or epoch seconds/milliseconds, and
/// the `expiry_date` form as epoch milliseconds. Secrets without a recognised token
/// layout are read as snake_case.
pub fn token_expiry(secret: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let shape = TokenShape::detect(secret).unwrap_or(TokenShape::Snake);
    let tokens = shape.tokens(secret)?;
    let [at_key, date_key] = shape.expiry_keys();
    let raw = tokens
        .get(at_key)
        .filter(|v| !v.is_null())
        .or_else(|| tokens.get(date_key))?;
    match raw {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| text.parse::<i64>().ok().and_then(from_epoch)),
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value > 1_000_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// True when the secret is OAuth-shaped and expires within the refresh buffer
pub fn needs_refresh(secret: &Map<String, Value>, now: DateTime<Utc>) -> bool {
    if TokenShape::detect(secret).is_none() {
        return false;
    }
    token_expiry(secret)
        .map(|expiry| expiry - now <= chrono::Duration::seconds(REFRESH_BUFFER_SECS))
        .unwrap_or(false)
}

/// First non-empty string among `names`
fn text_field<'a>(secret: &'a Map<String, Value>, names: &[&str]) -> &'a str {
    names
        .iter()
        .filter_map(|name| secret.get(*name).and_then(Value::as_str))
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

/// Fetches secrets and keeps OAuth tokens fresh
pub struct CredentialAccessor {
    service: Arc<dyn CredentialService>,
    oauth: Option<Arc<dyn OAuthProviderRegistry>>,
    /// One refresh at a time per credential id
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for CredentialAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialAccessor")
            .field("oauth", &self.oauth.is_some())
            .finish()
    }
}

impl CredentialAccessor {
    pub fn new(service: Arc<dyn CredentialService>, oauth: Option<Arc<dyn OAuthProviderRegistry>>) -> Self {
        Self {
            service,
            oauth,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Decrypted secret for `credential_type`, refreshed if due, with redaction markers
    pub async fn get_credentials(
        &self,
        credential_type: &str,
        references: &HashMap<String, String>,
        user_id: &str,
    ) -> EngineResult<Map<String, Value>> {
        let credential_id = references.get(credential_type).ok_or_else(|| {
            EngineError::Credential(format!("node has no credentials of type '{}' configured", credential_type))
        })?;

        let mut secret = self.fetch(credential_id, user_id).await?;

        if needs_refresh(&secret, Utc::now()) {
            if let Some(oauth) = &self.oauth {
                secret = self.refresh_locked(oauth.as_ref(), credential_id, user_id, secret).await?;
            }
        }

        Ok(add_redaction_markers(&secret))
    }

    async fn fetch(&self, credential_id: &str, user_id: &str) -> EngineResult<Map<String, Value>> {
        self.service
            .get_credential_for_execution(credential_id, user_id)
            .await
            .map_err(|e| EngineError::Credential(format!("failed to load credential {}: {}", credential_id, e)))
    }

    fn lock_for(&self, credential_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(credential_id.to_string()).or_default())
    }

    /// Refresh under the per-credential lock; a concurrent refresh is not repeated
    async fn refresh_locked(
        &self,
        oauth: &dyn OAuthProviderRegistry,
        credential_id: &str,
        user_id: &str,
        stale: Map<String, Value>,
    ) -> EngineResult<Map<String, Value>> {
        let lock = self.lock_for(credential_id);
        let _held = lock.lock().await;

        // Someone else may have refreshed while we waited
        let current = self.fetch(credential_id, user_id).await.unwrap_or(stale);
        if !needs_refresh(&current, Utc::now()) {
            return Ok(current);
        }

        let Some(shape) = TokenShape::detect(&current) else {
            return Ok(current);
        };
        let provider = match text_field(&current, &["provider"]) {
            "" => "oauth2",
            name => name,
        };
        let refresh_token = shape
            .tokens(&current)
            .map(|tokens| text_field(tokens, &[shape.refresh_key()]))
            .unwrap_or_default();

        tracing::info!("🔄 Refreshing OAuth token for credential {}", credential_id);
        let tokens = match oauth
            .refresh_access_token(
                provider,
                refresh_token,
                text_field(&current, &["client_id", "clientId"]),
                text_field(&current, &["client_secret", "clientSecret"]),
            )
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(
                    "⚠️ OAuth refresh failed for credential {}, using existing token: {}",
                    credential_id,
                    e
                );
                return Ok(current);
            }
        };

        let patch = shape.patch(&current, tokens);

        if let Err(e) = self.service.update_credential(credential_id, user_id, patch.clone()).await {
            tracing::error!("❌ Failed to persist refreshed token for credential {}: {}", credential_id, e);
        }

        let mut refreshed = current;
        for (key, value) in patch {
            refreshed.insert(key, value);
        }
        Ok(refreshed)
    }
}
