//! JSON-RPC gateway client used for template lookups.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::output::{TemplateCatalog, TemplateInfo};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: String,
    params: &'a Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: RpcResult,
}

#[derive(Debug, Deserialize)]
struct RpcResult {
    status: bool,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    errors: Option<RpcErrors>,
}

#[derive(Debug, Deserialize)]
struct RpcErrors {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    message: String,
}

/// Catalog backed by the gateway's `template.fetch` and `suite.fetch` methods.
pub struct GatewayCatalog {
    client: reqwest::Client,
    url: String,
}

impl GatewayCatalog {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn call(&self, component: &str, method: &str, params: Value) -> anyhow::Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: format!("{}.{}", component, method),
            params: &params,
            id: 1,
        };

        let envelope: RpcEnvelope = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{} request failed", request.method))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("malformed {} response", request.method))?;

        reply_body(envelope.result)
    }
}

fn reply_body(result: RpcResult) -> anyhow::Result<Value> {
    if !result.status {
        let errors = result.errors.unwrap_or(RpcErrors {
            code: Value::Null,
            message: String::new(),
        });
        return Err(anyhow!("api error {}: {}", errors.code, errors.message));
    }
    Ok(result
        .response
        .unwrap_or_else(|| Value::Object(Map::new())))
}

fn string_field(body: &Value, field: &str) -> anyhow::Result<String> {
    match body.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(anyhow!("response has no {}", field)),
        Some(other) => Ok(other.to_string()),
    }
}

#[async_trait]
impl TemplateCatalog for GatewayCatalog {
    async fn template(&self, template_id: &str) -> anyhow::Result<TemplateInfo> {
        let body = self
            .call("template", "fetch", json!({ "id": template_id }))
            .await?;
        Ok(TemplateInfo {
            suite_id: string_field(&body, "suite_id")?,
            meta: body.get("meta").cloned().unwrap_or_else(|| json!({})),
        })
    }

    async fn suite_profile(&self, suite_id: &str) -> anyhow::Result<String> {
        let body = self.call("suite", "fetch", json!({ "id": suite_id })).await?;
        string_field(&body, "profile_id")
    }
}
