//! Processing steps: the units a resource's behavior pipeline is built from.

use crate::behavior::ResponseBehavior;
use crate::capture::{CaptureConfig, CaptureService};
use crate::exchange::Exchange;
use crate::scripting::{RuntimeContext, ScriptEngineRegistry, ScriptSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One step of a resource's behavior pipeline. Steps run sequentially and
/// each produces a partial [`ResponseBehavior`]; later steps take precedence
/// over earlier ones for the fields they set.
#[async_trait]
pub trait ProcessingStep: Send + Sync {
    fn step_id(&self) -> &str;

    async fn execute(
        &self,
        exchange: &Exchange,
        ctx: &mut RuntimeContext,
    ) -> anyhow::Result<ResponseBehavior>;
}

/// Outbound call settings for a remote-call step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCallConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Send the incoming request body instead of a configured one.
    #[serde(default)]
    pub forward_request_body: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Declarative step configuration as it appears on a resource rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepConfig {
    #[serde(rename_all = "camelCase")]
    Script { step_id: String, script: ScriptSource },
    #[serde(rename_all = "camelCase")]
    Remote {
        step_id: String,
        #[serde(flatten)]
        call: RemoteCallConfig,
        #[serde(default)]
        captures: Vec<CaptureConfig>,
    },
}

impl StepConfig {
    pub fn step_id(&self) -> &str {
        match self {
            StepConfig::Script { step_id, .. } => step_id,
            StepConfig::Remote { step_id, .. } => step_id,
        }
    }
}

/// Runs a pre-registered script and returns whatever behavior it describes.
pub struct ScriptStep {
    step_id: String,
    script: ScriptSource,
    engines: Arc<ScriptEngineRegistry>,
}

impl ScriptStep {
    pub fn new(step_id: String, script: ScriptSource, engines: Arc<ScriptEngineRegistry>) -> Self {
        Self {
            step_id,
            script,
            engines,
        }
    }
}

#[async_trait]
impl ProcessingStep for ScriptStep {
    fn step_id(&self) -> &str {
        &self.step_id
    }

    async fn execute(
        &self,
        _exchange: &Exchange,
        ctx: &mut RuntimeContext,
    ) -> anyhow::Result<ResponseBehavior> {
        let engine = self.engines.engine_for(&self.script.lang)?;
        debug!(step = %self.step_id, script = %self.script.id, "executing script step");
        engine.execute(&self.script.id, ctx)
    }
}

/// Calls an external HTTP service, captures values from its response into
/// the context bindings, and otherwise defers to the rule's defaults.
///
/// A failed call never fails the exchange: the step substitutes a bare 500
/// so the client still gets a response.
pub struct RemoteStep {
    step_id: String,
    call: RemoteCallConfig,
    captures: Vec<CaptureConfig>,
    client: reqwest::Client,
    capture_service: Arc<dyn CaptureService>,
}

impl RemoteStep {
    pub fn new(
        step_id: String,
        call: RemoteCallConfig,
        captures: Vec<CaptureConfig>,
        client: reqwest::Client,
        capture_service: Arc<dyn CaptureService>,
    ) -> Self {
        Self {
            step_id,
            call,
            captures,
            client,
            capture_service,
        }
    }

    async fn perform(&self, ctx: &RuntimeContext) -> anyhow::Result<(u16, HashMap<String, String>, String)> {
        let url = expand_context_placeholders(&self.call.url, ctx);
        let method = reqwest::Method::from_bytes(self.call.method.to_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut request = self.client.request(method, &url);
        for (name, value) in &self.call.headers {
            request = request.header(name, expand_context_placeholders(value, ctx));
        }
        if self.call.forward_request_body {
            if let Some(body) = &ctx.body {
                request = request.body(body.clone());
            }
        } else if let Some(body) = &self.call.body {
            request = request.body(expand_context_placeholders(body, ctx));
        }
        if let Some(timeout_ms) = self.call.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("remote call returned status {}", response.status());
        }
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;
        Ok((status, headers, body))
    }
}

#[async_trait]
impl ProcessingStep for RemoteStep {
    fn step_id(&self) -> &str {
        &self.step_id
    }

    async fn execute(
        &self,
        _exchange: &Exchange,
        ctx: &mut RuntimeContext,
    ) -> anyhow::Result<ResponseBehavior> {
        match self.perform(ctx).await {
            Ok((status, headers, body)) => {
                debug!(step = %self.step_id, status, "remote call completed");
                self.capture_service
                    .capture(&self.captures, status, &headers, &body, &mut ctx.bindings);
                Ok(ResponseBehavior::new())
            }
            Err(e) => {
                warn!(step = %self.step_id, "remote call failed, substituting 500: {e:#}");
                Ok(ResponseBehavior::with_status(500))
            }
        }
    }
}

/// Expand `${context.request.*}` and `${context.bindings.*}` placeholders in
/// a configured string. Unknown placeholders are left as-is.
pub(crate) fn expand_context_placeholders(input: &str, ctx: &RuntimeContext) -> String {
    if !input.contains("${") {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        match lookup_placeholder(key, ctx) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn lookup_placeholder(key: &str, ctx: &RuntimeContext) -> Option<String> {
    match key {
        "context.request.method" => return Some(ctx.method.clone()),
        "context.request.path" => return Some(ctx.path.clone()),
        "context.request.body" => return ctx.body.clone(),
        _ => {}
    }
    if let Some(name) = key.strip_prefix("context.request.pathParams.") {
        return ctx.path_params.get(name).cloned();
    }
    if let Some(name) = key.strip_prefix("context.request.queryParams.") {
        return ctx.query_params.get(name).cloned();
    }
    if let Some(name) = key.strip_prefix("context.request.formParams.") {
        return ctx.form_params.get(name).cloned();
    }
    if let Some(name) = key.strip_prefix("context.request.headers.") {
        return ctx
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone());
    }
    if let Some(name) = key.strip_prefix("context.bindings.") {
        return ctx.bindings.get(name).map(json_value_string);
    }
    if let Some(name) = key.strip_prefix("context.env.") {
        return ctx.env.get(name).cloned();
    }
    None
}

fn json_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::exchange::HttpRequest;

    fn ctx() -> RuntimeContext {
        let mut request = HttpRequest::new("GET", "/pets/42");
        request
            .path_params
            .insert("petId".to_string(), "42".to_string());
        request
            .headers
            .insert("X-Tenant".to_string(), "acme".to_string());
        let exchange = Exchange::new(request);
        let mut ctx = RuntimeContext::for_exchange(&exchange, &EngineConfig::default());
        ctx.bindings
            .insert("ownerName".to_string(), "Ada".into());
        ctx
    }

    #[test]
    fn test_expand_request_placeholders() {
        let ctx = ctx();
        assert_eq!(
            expand_context_placeholders(
                "http://upstream/pets/${context.request.pathParams.petId}",
                &ctx
            ),
            "http://upstream/pets/42"
        );
        assert_eq!(
            expand_context_placeholders("${context.request.method} ${context.request.path}", &ctx),
            "GET /pets/42"
        );
    }

    #[test]
    fn test_expand_header_case_insensitive() {
        let ctx = ctx();
        assert_eq!(
            expand_context_placeholders("${context.request.headers.x-tenant}", &ctx),
            "acme"
        );
    }

    #[test]
    fn test_expand_bindings() {
        let ctx = ctx();
        assert_eq!(
            expand_context_placeholders("owner is ${context.bindings.ownerName}", &ctx),
            "owner is Ada"
        );
    }

    #[test]
    fn test_unknown_placeholder_left_intact() {
        let ctx = ctx();
        assert_eq!(
            expand_context_placeholders("${context.request.queryParams.missing}", &ctx),
            "${context.request.queryParams.missing}"
        );
        assert_eq!(expand_context_placeholders("${unterminated", &ctx), "${unterminated");
    }

    #[test]
    fn test_step_config_deserializes_script_and_remote() {
        let script: StepConfig = serde_json::from_str(
            r##"{"type": "script", "stepId": "s1", "script": {"id": "hello", "code": "#{}"}}"##,
        )
        .unwrap();
        assert_eq!(script.step_id(), "s1");

        let remote: StepConfig = serde_json::from_str(
            r#"{
                "type": "remote",
                "stepId": "r1",
                "url": "http://upstream/owners",
                "method": "post",
                "captures": [{"binding": "ownerName", "jsonPath": "$.name"}]
            }"#,
        )
        .unwrap();
        match remote {
            StepConfig::Remote { call, captures, .. } => {
                assert_eq!(call.method, "post");
                assert_eq!(captures.len(), 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
