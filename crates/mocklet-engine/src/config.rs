//! Engine configuration and resolved response configuration types.
//!
//! Configuration file parsing lives outside this crate; these types arrive
//! fully resolved from the loader.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// How resource handlers are executed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionMode {
    /// The handler runs on the task that received the request.
    #[default]
    Sync,
    /// The handler is dispatched onto the worker pool; the caller awaits a
    /// completion signal before writing the response.
    Async,
}

/// Delay simulation applied before any response bytes are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PerformanceSimulation {
    /// Fixed delay in milliseconds.
    Exact {
        #[serde(rename = "exactDelayMs")]
        exact_delay_ms: u64,
    },
    /// Uniformly random delay within `[min, max]` inclusive.
    Range {
        #[serde(rename = "minDelayMs")]
        min_delay_ms: u64,
        #[serde(rename = "maxDelayMs")]
        max_delay_ms: u64,
    },
}

impl PerformanceSimulation {
    /// Pick the concrete delay for this request.
    pub fn delay_ms(&self) -> u64 {
        match self {
            PerformanceSimulation::Exact { exact_delay_ms } => *exact_delay_ms,
            PerformanceSimulation::Range {
                min_delay_ms,
                max_delay_ms,
            } => {
                use rand::Rng;
                if max_delay_ms > min_delay_ms {
                    rand::thread_rng().gen_range(*min_delay_ms..=*max_delay_ms)
                } else {
                    *min_delay_ms
                }
            }
        }
    }
}

/// Failure simulation: bypasses normal body writing entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureType {
    /// Close the transport without sending a response.
    CloseConnection,
    /// End the response with no body and whatever status/headers were set.
    EmptyResponse,
}

/// Declared default response configuration attached to a resource rule.
///
/// These values fill in a resolved behavior only where a script has not
/// already set them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseConfig {
    pub status_code: Option<u16>,
    /// Inline response content.
    pub content: Option<String>,
    /// Response file, relative to the engine's response file directory.
    pub file: Option<String>,
    /// Whether the content/file body contains `${...}` placeholders.
    pub template: bool,
    /// Named example from the API description, for example-deriving senders.
    pub example_name: Option<String>,
    pub headers: HashMap<String, String>,
    pub performance: Option<PerformanceSimulation>,
    pub failure: Option<FailureType>,
}

fn default_not_found_message() -> String {
    "Resource not found".to_string()
}

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Body of the built-in plain-text 404 response.
    pub not_found_message: String,
    /// Handler execution mode.
    pub execution_mode: ExecutionMode,
    /// Base directory for response files.
    pub response_file_dir: PathBuf,
    /// Sort registered routes so exact literal paths are tried before
    /// templated/regex paths.
    pub prioritize_exact_routes: bool,
    /// Environment values exposed to scripts.
    pub env: HashMap<String, String>,
    /// Opaque per-plugin configuration exposed to scripts.
    pub plugin_config: serde_json::Value,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            not_found_message: default_not_found_message(),
            execution_mode: ExecutionMode::Sync,
            response_file_dir: PathBuf::from("."),
            prioritize_exact_routes: true,
            env: HashMap::new(),
            plugin_config: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_delay() {
        let sim = PerformanceSimulation::Exact { exact_delay_ms: 250 };
        assert_eq!(sim.delay_ms(), 250);
    }

    #[test]
    fn test_range_delay_within_bounds() {
        let sim = PerformanceSimulation::Range {
            min_delay_ms: 100,
            max_delay_ms: 200,
        };
        for _ in 0..20 {
            let d = sim.delay_ms();
            assert!((100..=200).contains(&d), "delay {d} outside [100, 200]");
        }
    }

    #[test]
    fn test_degenerate_range_uses_min() {
        let sim = PerformanceSimulation::Range {
            min_delay_ms: 300,
            max_delay_ms: 300,
        };
        assert_eq!(sim.delay_ms(), 300);
    }

    #[test]
    fn test_performance_simulation_serde() {
        let json = r#"{"exactDelayMs": 500}"#;
        let sim: PerformanceSimulation = serde_json::from_str(json).unwrap();
        assert_eq!(sim, PerformanceSimulation::Exact { exact_delay_ms: 500 });

        let json = r#"{"minDelayMs": 1000, "maxDelayMs": 2000}"#;
        let sim: PerformanceSimulation = serde_json::from_str(json).unwrap();
        assert_eq!(
            sim,
            PerformanceSimulation::Range {
                min_delay_ms: 1000,
                max_delay_ms: 2000
            }
        );
    }

    #[test]
    fn test_response_config_defaults() {
        let config: ResponseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.status_code, None);
        assert!(!config.template);
        assert!(config.headers.is_empty());
    }
}
