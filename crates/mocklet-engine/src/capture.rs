//! Value capture: pulls fields out of a remote response into script
//! bindings for later steps.

use crate::matcher::body_query::{query_json, query_xml};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// One capture declaration on a remote-call step: where to read the value
/// from and the binding name later steps see it under.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Binding name exposed to subsequent script steps.
    pub binding: String,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default, rename = "xPath")]
    pub x_path: Option<String>,
    /// Capture a response header instead of a body field.
    #[serde(default)]
    pub header: Option<String>,
}

/// Applies capture declarations to a remote response. Pluggable so callers
/// can substitute their own extraction strategy.
pub trait CaptureService: Send + Sync {
    fn capture(
        &self,
        configs: &[CaptureConfig],
        status: u16,
        headers: &HashMap<String, String>,
        body: &str,
        bindings: &mut HashMap<String, serde_json::Value>,
    );
}

/// Default capture service: JSONPath/XPath over the body, case-insensitive
/// header lookup. Captures that produce nothing bind nothing.
#[derive(Default)]
pub struct BodyCaptureService;

impl CaptureService for BodyCaptureService {
    fn capture(
        &self,
        configs: &[CaptureConfig],
        status: u16,
        headers: &HashMap<String, String>,
        body: &str,
        bindings: &mut HashMap<String, serde_json::Value>,
    ) {
        bindings.insert("remoteStatusCode".to_string(), status.into());

        for config in configs {
            let value = if let Some(name) = &config.header {
                headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.clone())
            } else if let Some(path) = &config.json_path {
                query_json(body, path)
            } else if let Some(path) = &config.x_path {
                query_xml(body, path)
            } else {
                None
            };

            match value {
                Some(value) => {
                    debug!(binding = %config.binding, "captured remote value");
                    bindings.insert(config.binding.clone(), value.into());
                }
                None => {
                    debug!(binding = %config.binding, "capture produced no value");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(configs: &[CaptureConfig], body: &str) -> HashMap<String, serde_json::Value> {
        let mut headers = HashMap::new();
        headers.insert("X-Request-Id".to_string(), "abc-123".to_string());
        let mut bindings = HashMap::new();
        BodyCaptureService.capture(configs, 200, &headers, body, &mut bindings);
        bindings
    }

    #[test]
    fn test_capture_json_path() {
        let configs = vec![CaptureConfig {
            binding: "ownerName".to_string(),
            json_path: Some("$.owner.name".to_string()),
            x_path: None,
            header: None,
        }];
        let bindings = run(&configs, r#"{"owner": {"name": "Ada"}}"#);
        assert_eq!(bindings.get("ownerName"), Some(&"Ada".into()));
        assert_eq!(bindings.get("remoteStatusCode"), Some(&200.into()));
    }

    #[test]
    fn test_capture_header_case_insensitive() {
        let configs = vec![CaptureConfig {
            binding: "requestId".to_string(),
            json_path: None,
            x_path: None,
            header: Some("x-request-id".to_string()),
        }];
        let bindings = run(&configs, "");
        assert_eq!(bindings.get("requestId"), Some(&"abc-123".into()));
    }

    #[test]
    fn test_missing_value_binds_nothing() {
        let configs = vec![CaptureConfig {
            binding: "missing".to_string(),
            json_path: Some("$.nope".to_string()),
            x_path: None,
            header: None,
        }];
        let bindings = run(&configs, r#"{"owner": null}"#);
        assert!(!bindings.contains_key("missing"));
    }

    #[test]
    fn test_malformed_body_binds_nothing() {
        let configs = vec![CaptureConfig {
            binding: "value".to_string(),
            json_path: Some("$.a".to_string()),
            x_path: None,
            header: None,
        }];
        let bindings = run(&configs, "not json");
        assert!(!bindings.contains_key("value"));
    }
}
