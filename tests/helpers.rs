mod common;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nodeward::collaborators::{CredentialService, OAuthProviderRegistry};
use nodeward::helpers::{CredentialAccessor, HttpHelper, RequestOptions};
use nodeward::{ErrorKind, ExecuteNodeRequest};

use common::{CountingProvider, MemoryCredentials};

fn http_request(url: &str) -> ExecuteNodeRequest {
    ExecuteNodeRequest::new("nodeward.httpRequest").with_parameters(json!({ "url": url }))
}

#[tokio::test]
async fn internal_and_non_http_targets_are_refused() {
    let executor = common::executor(false, None, None).await;

    for url in [
        "http://127.0.0.1:8080/admin",
        "http://localhost/",
        "http://10.0.0.5/",
        "http://172.16.4.2/",
        "http://192.168.1.1/",
        "http://0.0.0.0/",
        "http://[::1]/",
        "file:///etc/passwd",
        "ftp://example.com/file",
    ] {
        let outcome = executor.execute_node(http_request(url)).await;
        assert!(!outcome.success, "{} should be refused", url);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::SecurityPolicy, "{}", url);
    }
}

#[tokio::test]
async fn redirects_are_checked_against_the_policy() {
    let addr = common::spawn_mock_server().await;
    let mut config = common::config(true);
    config.http.denied_domains = vec!["localhost".to_string()];
    let http = HttpHelper::new(config.http.clone()).unwrap();

    // /redirect points at localhost, which is denied even though internal hosts are allowed
    let err = http
        .request("exec-1", &config.limits, RequestOptions::get(format!("http://{}/redirect", addr)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityPolicy);

    let ok = http
        .request("exec-1", &config.limits, RequestOptions::get(format!("http://{}/json", addr)))
        .await
        .unwrap();
    assert_eq!(ok.body, json!({"hello": "world"}));
    assert_eq!(http.gate().in_flight("exec-1"), 0);
}

#[tokio::test]
async fn third_concurrent_request_fails_fast() {
    let addr = common::spawn_mock_server().await;
    let executor = common::executor(true, None, None).await;
    let limits = common::config(true).limits;
    let url = format!("http://{}/slow", addr);

    let (a, b, c) = tokio::join!(
        executor.http().request("exec-1", &limits, RequestOptions::get(url.clone())),
        executor.http().request("exec-1", &limits, RequestOptions::get(url.clone())),
        executor.http().request("exec-1", &limits, RequestOptions::get(url.clone())),
    );

    let results = [a, b, c];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let limited = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::ResourceLimit))
        .count();
    assert_eq!(ok, 2);
    assert_eq!(limited, 1);
    assert_eq!(executor.http().gate().in_flight("exec-1"), 0);

    // Another execution has its own budget
    let other = executor.http().request("exec-2", &limits, RequestOptions::get(url)).await;
    assert!(other.is_ok());
}

#[tokio::test]
async fn http_node_turns_responses_into_items() {
    let addr = common::spawn_mock_server().await;
    let executor = common::executor(true, None, None).await;

    let outcome = executor.execute_node(http_request(&format!("http://{}/json", addr))).await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.data.unwrap().main[0].json["hello"], json!("world"));

    let outcome = executor.execute_node(http_request(&format!("http://{}/list", addr))).await;
    assert_eq!(outcome.data.unwrap().main.len(), 3);

    let outcome = executor.execute_node(http_request(&format!("http://{}/missing", addr))).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::Node);

    let request = ExecuteNodeRequest::new("nodeward.httpRequest").with_parameters(json!({
        "url": format!("http://{}/missing", addr),
        "ignoreHttpErrors": true,
        "fullResponse": true
    }));
    let outcome = executor.execute_node(request).await;
    assert!(outcome.success, "{:?}", outcome.error);
    let item = &outcome.data.unwrap().main[0].json;
    assert_eq!(item["status"], json!(404));
    assert_eq!(item["body"], json!("nope"));
}

#[tokio::test]
async fn http_node_resolves_url_per_item() {
    let addr = common::spawn_mock_server().await;
    let executor = common::executor(true, None, None).await;

    let request = ExecuteNodeRequest::new("nodeward.httpRequest")
        .with_main_input(vec![json!({"path": "json"}), json!({"path": "list"})])
        .with_parameters(json!({ "url": format!("http://{}/{{{{ $json.path }}}}", addr) }));
    let outcome = executor.execute_node(request).await;

    assert!(outcome.success, "{:?}", outcome.error);
    let main = outcome.data.unwrap().main;
    assert_eq!(main.len(), 4);
    assert_eq!(main[0].paired_item, Some(json!(0)));
    assert_eq!(main[3].paired_item, Some(json!(1)));
}

#[tokio::test]
async fn only_allow_listed_headers_are_sent() {
    let addr = common::spawn_mock_server().await;
    let executor = common::executor(true, None, None).await;

    let request = ExecuteNodeRequest::new("nodeward.httpRequest").with_parameters(json!({
        "url": format!("http://{}/headers", addr),
        "headers": {"X-Trace": "abc", "Accept": "application/json", "Cookie": "session=1", "Host": "evil"}
    }));
    let outcome = executor.execute_node(request).await;

    assert!(outcome.success, "{:?}", outcome.error);
    let seen = &outcome.data.unwrap().main[0].json;
    assert_eq!(seen["x-trace"], json!("abc"));
    assert_eq!(seen["accept"], json!("application/json"));
    assert!(seen.get("cookie").is_none());
    assert_ne!(seen["host"], json!("evil"));
}

#[tokio::test]
async fn oversized_response_is_refused() {
    let addr = common::spawn_mock_server().await;
    let executor = common::executor(true, None, None).await;

    let outcome = executor.execute_node(http_request(&format!("http://{}/big", addr))).await;
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::ResourceLimit);
}

#[tokio::test]
async fn basic_auth_header_comes_from_the_credential() {
    let addr = common::spawn_mock_server().await;
    let credentials = Arc::new(MemoryCredentials::default());
    credentials
        .insert("cred-basic", json!({"user": "user", "password": "pass"}))
        .await;
    let service: Arc<dyn CredentialService> = credentials.clone();
    let executor = common::executor(true, Some(service), None).await;

    let mut request = ExecuteNodeRequest::new("nodeward.httpRequest").with_parameters(json!({
        "url": format!("http://{}/headers", addr),
        "authentication": "httpBasicAuth"
    }));
    request
        .credentials
        .insert("httpBasicAuth".to_string(), "cred-basic".to_string());
    let outcome = executor.execute_node(request).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.data.unwrap().main[0].json["authorization"], json!("Basic dXNlcjpwYXNz"));
}

#[tokio::test]
async fn missing_credential_reference_is_a_credential_error() {
    let credentials: Arc<dyn CredentialService> = Arc::new(MemoryCredentials::default());
    let executor = common::executor(true, Some(credentials), None).await;

    let request = ExecuteNodeRequest::new("nodeward.httpRequest").with_parameters(json!({
        "url": "https://example.com/",
        "authentication": "httpHeaderAuth"
    }));
    let outcome = executor.execute_node(request).await;
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::Credential);
}

fn expired_oauth() -> Value {
    json!({
        "access_token": "stale",
        "refresh_token": "r-1",
        "client_id": "client",
        "client_secret": "shh",
        "expires_at": (chrono::Utc::now() - chrono::Duration::minutes(1)).to_rfc3339()
    })
}

#[tokio::test]
async fn expired_oauth_token_is_refreshed_once_and_persisted() {
    let addr = common::spawn_mock_server().await;
    let credentials = Arc::new(MemoryCredentials::default());
    credentials.insert("cred-oauth", expired_oauth()).await;
    let provider = Arc::new(CountingProvider::default());

    let service: Arc<dyn CredentialService> = credentials.clone();
    let oauth: Arc<dyn OAuthProviderRegistry> = provider.clone();
    let executor = common::executor(true, Some(service), Some(oauth)).await;

    let request = || {
        let mut request = ExecuteNodeRequest::new("nodeward.httpRequest").with_parameters(json!({
            "url": format!("http://{}/headers", addr),
            "authentication": "oAuth2Api"
        }));
        request.credentials.insert("oAuth2Api".to_string(), "cred-oauth".to_string());
        request.meta.execution_id = "exec-oauth".to_string();
        request
    };

    let (first, second) = tokio::join!(executor.execute_node(request()), executor.execute_node(request()));

    for outcome in [first, second] {
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.data.unwrap().main[0].json["authorization"], json!("Bearer fresh-1"));
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(credentials.updates.load(Ordering::SeqCst), 1);
    assert_eq!(credentials.get("cred-oauth").await["access_token"], json!("fresh-1"));
}

#[tokio::test]
async fn failed_refresh_falls_back_to_the_stale_token() {
    let credentials = Arc::new(MemoryCredentials::default());
    credentials.insert("cred-oauth", expired_oauth()).await;
    let provider = Arc::new(CountingProvider {
        fail: true,
        ..CountingProvider::default()
    });

    let accessor = CredentialAccessor::new(credentials.clone(), Some(provider.clone()));
    let references = HashMap::from([("oAuth2Api".to_string(), "cred-oauth".to_string())]);
    let secret = accessor.get_credentials("oAuth2Api", &references, "user-1").await.unwrap();

    assert_eq!(secret["access_token"], json!("stale"));
    assert_eq!(secret["access_token_sanitized"], json!("[REDACTED]"));
    assert_eq!(secret["client_secret_sanitized"], json!("[REDACTED]"));
    assert!(secret.get("client_id_sanitized").is_none());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(credentials.updates.load(Ordering::SeqCst), 0);
}
