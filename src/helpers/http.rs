/// SSRF-guarded HTTP helper
///
/// Every outbound request from node logic goes through here. The URL is checked
/// before any I/O (and again on every redirect hop), hostnames are checked again
/// once resolved, headers pass an allow-list, and each execution id may only have a
/// bounded number of requests in flight.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{ExecutionLimits, HttpPolicyConfig};
use crate::error::{EngineError, EngineResult};

/// Headers node logic may set; any `x-*` header is allowed as well
pub const ALLOWED_HEADERS: [&str; 5] = ["content-type", "accept", "user-agent", "authorization", "x-api-key"];

/// Header used for API-key credentials that do not name one
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-KEY";

const MAX_REDIRECTS: usize = 10;

/// Options accepted by `request`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestOptions {
    /// HTTP method, GET when empty
    pub method: String,
    #[serde(alias = "uri")]
    pub url: String,
    pub headers: Map<String, Value>,
    /// Query-string parameters
    pub qs: Map<String, Value>,
    pub body: Option<Value>,
    /// Send `body` as JSON (default for objects and arrays)
    pub json: Option<bool>,
    /// Caller timeout, clamped to the configured ceiling
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Decode options coming from node parameters or script output
    pub fn from_value(value: Value) -> EngineResult<Self> {
        serde_json::from_value(value).map_err(|e| EngineError::InvalidData(format!("invalid request options: {}", e)))
    }
}

/// Response handed back to node logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Map<String, Value>,
    /// Parsed JSON when the body is JSON, text otherwise
    pub body: Value,
}

impl HttpResponse {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Reject non-http(s) URLs and loopback/private/unspecified hosts
pub fn validate_url(raw: &str, allow_internal: bool) -> EngineResult<Url> {
    let url = Url::parse(raw).map_err(|e| EngineError::InvalidData(format!("invalid URL '{}': {}", raw, e)))?;
    check_url(&url, allow_internal)?;
    Ok(url)
}

/// `validate_url` plus the policy's denied domains
pub fn validate_url_with(raw: &str, policy: &HttpPolicyConfig) -> EngineResult<Url> {
    let url = validate_url(raw, policy.allow_internal_urls)?;
    check_denied(&url, &policy.denied_domains)?;
    Ok(url)
}

/// `*.example.com` matches the domain and its subdomains; anything else is exact
pub fn domain_matches(host: &str, pattern: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host == suffix || host.ends_with(&format!(".{}", suffix)),
        None => host == pattern,
    }
}

fn check_denied(url: &Url, denied: &[String]) -> EngineResult<()> {
    let host = url
        .host_str()
        .map(|host| host.trim_end_matches('.').to_ascii_lowercase())
        .unwrap_or_default();
    if denied.iter().any(|pattern| domain_matches(&host, &pattern.to_ascii_lowercase())) {
        return Err(EngineError::SecurityPolicy(format!("host '{}' is denied by policy", host)));
    }
    Ok(())
}

fn check_url(url: &Url, allow_internal: bool) -> EngineResult<()> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(EngineError::SecurityPolicy(format!(
                "protocol '{}' is not allowed, only http and https",
                other
            )))
        }
    }

    if allow_internal {
        return Ok(());
    }

    let host = url
        .host_str()
        .ok_or_else(|| EngineError::SecurityPolicy("URL has no host".to_string()))?;
    let bare = host.trim_start_matches('[').trim_end_matches(']');

    let blocked = match bare.parse::<IpAddr>() {
        Ok(ip) => is_internal_address(&ip),
        Err(_) => {
            let domain = bare.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
    };

    if blocked {
        return Err(EngineError::SecurityPolicy(format!(
            "requests to internal host '{}' are blocked",
            host
        )));
    }
    Ok(())
}

fn is_internal_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
}

fn is_internal_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_internal_ipv4(&mapped);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local
        || (first & 0xffc0) == 0xfe80 // link-local
}

/// True when `addr` would be refused by the host check
pub fn is_internal_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => is_internal_ipv4(ip),
        IpAddr::V6(ip) => is_internal_ipv6(ip),
    }
}

/// A hostname resolved to an address the policy refuses
#[derive(Debug, thiserror::Error)]
#[error("host '{host}' resolves to internal address {addr}")]
pub struct BlockedAddress {
    pub host: String,
    pub addr: IpAddr,
}

/// Resolve `host` and refuse it when any address is internal
///
/// Literal checks on the URL cannot see names like `10.0.0.1.nip.io`; this runs at
/// connect time for every hop, so the address actually dialed is the one checked.
pub async fn resolve_public(
    host: &str,
    allow_internal: bool,
) -> Result<Vec<SocketAddr>, Box<dyn std::error::Error + Send + Sync>> {
    let addrs: Vec<SocketAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, 0)],
        Err(_) => tokio::net::lookup_host((host, 0)).await?.collect(),
    };
    if addrs.is_empty() {
        return Err(format!("no addresses found for host '{}'", host).into());
    }

    if !allow_internal {
        if let Some(blocked) = addrs.iter().find(|addr| is_internal_address(&addr.ip())) {
            tracing::warn!("🚨 Refused {} resolving to internal address {}", host, blocked.ip());
            return Err(Box::new(BlockedAddress {
                host: host.to_string(),
                addr: blocked.ip(),
            }));
        }
    }
    Ok(addrs)
}

/// DNS resolver for the shared client
#[derive(Debug, Clone, Copy)]
struct GuardedResolver {
    allow_internal: bool,
}

impl reqwest::dns::Resolve for GuardedResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let host = name.as_str().to_string();
        let allow_internal = self.allow_internal;
        Box::pin(async move {
            let addrs = resolve_public(&host, allow_internal).await?;
            Ok(Box::new(addrs.into_iter()) as reqwest::dns::Addrs)
        })
    }
}

fn blocked_address(err: &reqwest::Error) -> Option<&BlockedAddress> {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(blocked) = cause.downcast_ref::<BlockedAddress>() {
            return Some(blocked);
        }
        source = cause.source();
    }
    None
}

/// Keep allow-listed headers; values that are not strings are stringified
pub fn filter_headers(headers: &Map<String, Value>) -> Vec<(String, String)> {
    let mut kept = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if !(ALLOWED_HEADERS.contains(&lower.as_str()) || lower.starts_with("x-")) {
            tracing::debug!("🚫 Dropped header not on allow-list: {}", name);
            continue;
        }
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        kept.push((lower, value));
    }
    kept
}

/// Per-execution in-flight request counter
#[derive(Debug, Default)]
pub struct RequestGate {
    active: Mutex<HashMap<String, usize>>,
}

impl RequestGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim a slot or fail immediately when `max` are already in flight
    pub fn try_acquire(self: &Arc<Self>, execution_id: &str, max: usize) -> EngineResult<RequestPermit> {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = active.entry(execution_id.to_string()).or_insert(0);
        if *count >= max {
            return Err(EngineError::ResourceLimit(format!(
                "maximum of {} concurrent requests reached for execution {}",
                max, execution_id
            )));
        }
        *count += 1;

        Ok(RequestPermit {
            gate: Arc::clone(self),
            execution_id: execution_id.to_string(),
        })
    }

    pub fn in_flight(&self, execution_id: &str) -> usize {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(execution_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Releases its slot on drop, whatever the request outcome
#[derive(Debug)]
pub struct RequestPermit {
    gate: Arc<RequestGate>,
    execution_id: String,
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        let mut active = self.gate.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = active.get_mut(&self.execution_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&self.execution_id);
            }
        }
    }
}

/// Credential-type specific header strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    Basic { user: String, password: String },
    ApiKey { header: String, key: String },
    Bearer { token: String },
}

impl AuthStrategy {
    /// Pick a strategy from the credential type name and the secret's fields
    pub fn from_credential(credential_type: &str, secret: &Map<String, Value>) -> EngineResult<Self> {
        let kind = credential_type.to_ascii_lowercase();
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| secret.get(*name).and_then(Value::as_str))
                .map(str::to_string)
        };

        if kind.contains("oauth2") {
            let token = field(&["access_token", "accessToken"])
                .or_else(|| {
                    secret
                        .get("oauthTokenData")
                        .and_then(|data| data.get("access_token"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .ok_or_else(|| EngineError::Credential(format!("{} credential has no access token", credential_type)))?;
            return Ok(AuthStrategy::Bearer { token });
        }

        if kind.contains("basic") {
            let user = field(&["user", "username"])
                .ok_or_else(|| EngineError::Credential(format!("{} credential has no user", credential_type)))?;
            let password = field(&["password"]).unwrap_or_default();
            return Ok(AuthStrategy::Basic { user, password });
        }

        if kind.contains("apikey") || kind.contains("api_key") || kind.contains("headerauth") {
            let key = field(&["apiKey", "api_key", "key", "value"])
                .ok_or_else(|| EngineError::Credential(format!("{} credential has no key", credential_type)))?;
            let header = field(&["headerName", "header_name", "name"]).unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string());
            return Ok(AuthStrategy::ApiKey { header, key });
        }

        Err(EngineError::Credential(format!(
            "unsupported credential type for authenticated requests: {}",
            credential_type
        )))
    }

    pub fn header(&self) -> (String, String) {
        match self {
            AuthStrategy::Basic { user, password } => (
                "authorization".to_string(),
                format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password))),
            ),
            AuthStrategy::ApiKey { header, key } => (header.clone(), key.clone()),
            AuthStrategy::Bearer { token } => ("authorization".to_string(), format!("Bearer {}", token)),
        }
    }
}

/// Outbound HTTP client shared by every execution
#[derive(Debug, Clone)]
pub struct HttpHelper {
    client: reqwest::Client,
    gate: Arc<RequestGate>,
    policy: HttpPolicyConfig,
}

impl HttpHelper {
    pub fn new(policy: HttpPolicyConfig) -> anyhow::Result<Self> {
        let allow_internal = policy.allow_internal_urls;
        let denied = policy.denied_domains.clone();
        let redirects = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            match check_url(attempt.url(), allow_internal).and_then(|()| check_denied(attempt.url(), &denied)) {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e),
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(policy.user_agent.clone())
            .redirect(redirects)
            .dns_resolver(Arc::new(GuardedResolver { allow_internal }))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            gate: RequestGate::new(),
            policy,
        })
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    /// Issue a request on behalf of `execution_id`
    pub async fn request(
        &self,
        execution_id: &str,
        limits: &ExecutionLimits,
        options: RequestOptions,
    ) -> EngineResult<HttpResponse> {
        self.send(execution_id, limits, options, None).await
    }

    /// Issue a request with a credential-derived header added after the allow-list
    pub async fn request_with_auth(
        &self,
        execution_id: &str,
        limits: &ExecutionLimits,
        options: RequestOptions,
        auth: &AuthStrategy,
    ) -> EngineResult<HttpResponse> {
        self.send(execution_id, limits, options, Some(auth.header())).await
    }

    async fn send(
        &self,
        execution_id: &str,
        limits: &ExecutionLimits,
        options: RequestOptions,
        auth_header: Option<(String, String)>,
    ) -> EngineResult<HttpResponse> {
        let url = validate_url_with(&options.url, &self.policy)?;
        let _permit = self.gate.try_acquire(execution_id, limits.max_concurrent_requests)?;

        let method_name = if options.method.is_empty() {
            "GET".to_string()
        } else {
            options.method.to_ascii_uppercase()
        };
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| EngineError::InvalidData(format!("unsupported HTTP method: {}", options.method)))?;

        let timeout_ms = options
            .timeout_ms
            .unwrap_or(limits.max_request_timeout_ms)
            .min(limits.max_request_timeout_ms);

        tracing::debug!("🌍 HTTP Request: {} {} (timeout {} ms)", method, url, timeout_ms);

        let mut builder = self
            .client
            .request(method, url.clone())
            .timeout(Duration::from_millis(timeout_ms));

        if !options.qs.is_empty() {
            let pairs: Vec<(String, String)> = options
                .qs
                .iter()
                .map(|(key, value)| {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), text)
                })
                .collect();
            builder = builder.query(&pairs);
        }

        for (name, value) in filter_headers(&options.headers) {
            builder = builder.header(name, value);
        }
        if let Some((name, value)) = auth_header {
            builder = builder.header(name, value);
        }

        if let Some(body) = &options.body {
            let as_json = options.json.unwrap_or(body.is_object() || body.is_array());
            builder = match body {
                _ if as_json => builder.json(body),
                Value::String(text) => builder.body(text.clone()),
                other => builder.body(other.to_string()),
            };
        }

        let mut response = builder.send().await.map_err(|e| {
            if let Some(blocked) = blocked_address(&e) {
                EngineError::SecurityPolicy(blocked.to_string())
            } else if e.is_timeout() {
                EngineError::ResourceLimit(format!("request to {} timed out after {} ms", url, timeout_ms))
            } else if e.is_redirect() {
                EngineError::SecurityPolicy(format!("redirect from {} refused: {}", url, e))
            } else {
                EngineError::Node(anyhow::anyhow!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), Value::String(s.to_string()))))
            .collect();

        let ceiling = limits.max_output_size;
        if let Some(length) = response.content_length() {
            if length as usize > ceiling {
                return Err(EngineError::ResourceLimit(format!(
                    "response of {} bytes exceeds limit of {} bytes",
                    length, ceiling
                )));
            }
        }

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                if e.is_timeout() {
                    EngineError::ResourceLimit(format!("request to {} timed out after {} ms", url, timeout_ms))
                } else {
                    EngineError::Node(anyhow::anyhow!("Failed to read response body: {}", e))
                }
            })?;
            let Some(chunk) = chunk else {
                break;
            };
            if buffer.len() + chunk.len() > ceiling {
                return Err(EngineError::ResourceLimit(format!(
                    "response body exceeds limit of {} bytes",
                    ceiling
                )));
            }
            buffer.extend_from_slice(&chunk);
        }

        tracing::debug!("📡 Response status: {} ({} bytes)", status, buffer.len());

        let body = serde_json::from_slice::<Value>(&buffer)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&buffer).into_owned()));

        Ok(HttpResponse { status, headers, body })
    }
}
