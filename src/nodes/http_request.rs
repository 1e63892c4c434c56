/// HTTP Request node
///
/// One request per input item (or a single request when there is no input), with
/// every parameter resolved against that item. Goes through the guarded request
/// helper, so SSRF checks and per-execution concurrency limits apply.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::helpers::{HttpResponse, RequestOptions};
use crate::node::types::{
    DisplayOptions, Item, NodeCredentialDescription, NodeDefinition, NodeHandler, NodeLogic, NodeProperty,
    OutputEntry, Properties, PropertyOption, PropertyType,
};
use crate::output::main_entry;
use crate::runtime::ExecutionContext;

pub const IDENTIFIER: &str = "nodeward.httpRequest";

const METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

pub fn definition() -> NodeDefinition {
    let mut definition = NodeDefinition::new(IDENTIFIER, "HTTP Request", NodeLogic::Host(Arc::new(HttpRequestNode)));
    definition.name = "httpRequest".to_string();
    definition.group = vec!["output".to_string()];
    definition.description = "Make an HTTP request and return the response".to_string();
    definition.properties = Properties::Generator(properties);
    definition.credentials = ["httpBasicAuth", "httpHeaderAuth", "oAuth2Api"]
        .iter()
        .map(|name| NodeCredentialDescription {
            name: name.to_string(),
            required: false,
        })
        .collect();
    definition
}

fn option(name: &str, value: &str) -> PropertyOption {
    PropertyOption {
        name: name.to_string(),
        value: json!(value),
        description: None,
    }
}

fn properties() -> Vec<NodeProperty> {
    let mut body = NodeProperty::new("body", "Body", PropertyType::Json);
    body.display_options = Some(DisplayOptions {
        show: HashMap::from([("method".to_string(), vec![json!("POST"), json!("PUT"), json!("PATCH")])]),
        hide: HashMap::new(),
    });

    vec![
        NodeProperty::new("method", "Method", PropertyType::Options)
            .with_default(json!("GET"))
            .with_options(METHODS.iter().map(|m| option(m, m)).collect()),
        NodeProperty::new("url", "URL", PropertyType::String).required(),
        NodeProperty::new("authentication", "Authentication", PropertyType::Options)
            .with_default(json!("none"))
            .with_options(vec![
                option("None", "none"),
                option("Basic Auth", "httpBasicAuth"),
                option("Header Auth", "httpHeaderAuth"),
                option("OAuth2", "oAuth2Api"),
            ]),
        NodeProperty::new("headers", "Headers", PropertyType::Json).with_default(json!({})),
        NodeProperty::new("queryParameters", "Query Parameters", PropertyType::Json).with_default(json!({})),
        body,
        NodeProperty::new("timeout", "Timeout (ms)", PropertyType::Number),
        NodeProperty::new("ignoreHttpErrors", "Ignore HTTP Errors", PropertyType::Boolean).with_default(json!(false)),
        NodeProperty::new("fullResponse", "Full Response", PropertyType::Boolean).with_default(json!(false)),
    ]
}

struct HttpRequestNode;

#[async_trait]
impl NodeHandler for HttpRequestNode {
    async fn execute(&self, ctx: &ExecutionContext, input: Vec<Item>) -> anyhow::Result<Vec<OutputEntry>> {
        let runs = input.len().max(1);
        let mut items = Vec::new();

        for index in 0..runs {
            let param = |name: &'static str| ctx.get_node_parameter(name, index);

            let options = RequestOptions {
                method: param("method").await?.as_str().unwrap_or("GET").to_string(),
                url: param("url")
                    .await?
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("HTTP Request 'url' must be a string"))?
                    .to_string(),
                headers: object_param(param("headers").await?),
                qs: object_param(param("queryParameters").await?),
                body: Some(param("body").await?).filter(|body| !body.is_null()),
                json: None,
                timeout_ms: param("timeout").await?.as_u64(),
            };

            tracing::debug!("🌐 HTTP Request node: {} {} (item {})", options.method, options.url, index);

            let authentication = param("authentication").await?;
            let response = match authentication.as_str() {
                None | Some("") | Some("none") => ctx.helpers().request(options).await?,
                Some(credential_type) => {
                    ctx.helpers()
                        .request_with_authentication(credential_type, options)
                        .await?
                }
            };

            let ignore_errors = param("ignoreHttpErrors").await?.as_bool().unwrap_or(false);
            if !response.is_success() && !ignore_errors {
                anyhow::bail!("Request failed with status code {}", response.status);
            }

            let full_response = param("fullResponse").await?.as_bool().unwrap_or(false);
            for mut item in response_items(response, full_response) {
                item.paired_item = Some(json!(index));
                items.push(item);
            }
        }

        Ok(vec![main_entry(items)])
    }
}

fn object_param(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(obj) => obj,
        _ => Map::new(),
    }
}

/// Array bodies fan out into one item per element; scalars land under `data`
fn response_items(response: HttpResponse, full_response: bool) -> Vec<Item> {
    if full_response {
        return vec![Item::from_value(response.to_value())];
    }
    match response.body {
        Value::Array(values) => values
            .into_iter()
            .map(|value| match value {
                Value::Object(obj) => Item::new(obj),
                other => Item::from_value(json!({ "data": other })),
            })
            .collect(),
        Value::Object(obj) => vec![Item::new(obj)],
        other => vec![Item::from_value(json!({ "data": other }))],
    }
}
