//! Script engine integration: the capability trait, the language registry,
//! and the built-in Rhai engine.

mod loggers;
mod rhai_engine;

pub use loggers::{ScriptLogger, ScriptLoggers};
pub use rhai_engine::RhaiScriptEngine;

use crate::behavior::ResponseBehavior;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::Exchange;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

fn default_lang() -> String {
    "rhai".to_string()
}

/// A resolved script source: an identifier (file path or resource ID), the
/// code itself, and the language the engine registry keys on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSource {
    pub id: String,
    pub code: String,
    #[serde(default = "default_lang")]
    pub lang: String,
}

impl ScriptSource {
    pub fn rhai(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            lang: default_lang(),
        }
    }
}

/// Runtime data made available to scripts: the request, environment, plugin
/// configuration, and bindings contributed by earlier steps or lifecycle
/// listeners.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub method: String,
    pub path: String,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub form_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub env: HashMap<String, String>,
    pub plugin_config: serde_json::Value,
    pub bindings: HashMap<String, serde_json::Value>,
}

impl RuntimeContext {
    pub fn for_exchange(exchange: &Exchange, config: &EngineConfig) -> Self {
        let request = &exchange.request;
        Self {
            method: request.method.clone(),
            path: request.path.clone(),
            path_params: request.path_params.clone(),
            query_params: request.query_params.clone(),
            form_params: request.form_params.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            env: config.env.clone(),
            plugin_config: config.plugin_config.clone(),
            bindings: HashMap::new(),
        }
    }
}

/// Capability interface implemented per scripting language.
///
/// `execute` may fail; the caller wraps the error and surfaces it as a
/// handler failure. `eval_predicate` errors are swallowed at the matcher
/// boundary and treated as a non-match.
pub trait ScriptEngine: Send + Sync {
    /// The language this engine handles, e.g. `"rhai"`.
    fn lang(&self) -> &str;

    /// Pre-register a script source; compile errors surface here, before any
    /// request traffic arrives.
    fn register_script(&self, id: &str, code: &str) -> anyhow::Result<()>;

    /// Execute a previously registered response script.
    fn execute(&self, id: &str, ctx: &RuntimeContext) -> anyhow::Result<ResponseBehavior>;

    /// Evaluate a previously registered predicate script to a boolean.
    fn eval_predicate(&self, id: &str, ctx: &RuntimeContext) -> anyhow::Result<bool>;
}

/// Strategy lookup: script language to engine.
pub struct ScriptEngineRegistry {
    engines: HashMap<String, Arc<dyn ScriptEngine>>,
}

impl ScriptEngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// A registry with the built-in Rhai engine installed.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_engine(Arc::new(RhaiScriptEngine::new()));
        registry
    }

    pub fn register_engine(&mut self, engine: Arc<dyn ScriptEngine>) {
        self.engines.insert(engine.lang().to_string(), engine);
    }

    pub fn engine_for(&self, lang: &str) -> Result<&Arc<dyn ScriptEngine>, EngineError> {
        self.engines
            .get(lang)
            .ok_or_else(|| EngineError::NoScriptEngine(lang.to_string()))
    }

    /// Register a script source with its engine, wrapping load failures.
    pub fn register_source(&self, source: &ScriptSource) -> Result<(), EngineError> {
        let engine = self.engine_for(&source.lang)?;
        engine
            .register_script(&source.id, &source.code)
            .map_err(|source_err| EngineError::ScriptLoad {
                script_id: source.id.clone(),
                source: source_err,
            })
    }
}

impl Default for ScriptEngineRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

static GLOBAL_REGISTRY: OnceCell<Arc<ScriptEngineRegistry>> = OnceCell::new();

/// Process-wide engine registry, initialized at most once per process.
pub fn global_registry() -> Arc<ScriptEngineRegistry> {
    GLOBAL_REGISTRY
        .get_or_init(|| Arc::new(ScriptEngineRegistry::with_builtin()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_builtin_rhai() {
        let registry = ScriptEngineRegistry::with_builtin();
        assert!(registry.engine_for("rhai").is_ok());
        assert!(matches!(
            registry.engine_for("lua"),
            Err(EngineError::NoScriptEngine(_))
        ));
    }

    #[test]
    fn test_register_source_surfaces_compile_errors() {
        let registry = ScriptEngineRegistry::with_builtin();
        let bad = ScriptSource::rhai("bad.rhai", "fn broken( {");
        assert!(matches!(
            registry.register_source(&bad),
            Err(EngineError::ScriptLoad { .. })
        ));

        let good = ScriptSource::rhai("good.rhai", "#{ statusCode: 200 }");
        assert!(registry.register_source(&good).is_ok());
    }

    #[test]
    fn test_global_registry_is_idempotent() {
        let a = global_registry();
        let b = global_registry();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_runtime_context_from_exchange() {
        use crate::exchange::HttpRequest;

        let request = HttpRequest::new("POST", "/pets")
            .with_query_string("limit=5")
            .with_header("X-Trace", "t1")
            .with_body(r#"{"name":"Rex"}"#);
        let exchange = Exchange::new(request);
        let ctx = RuntimeContext::for_exchange(&exchange, &EngineConfig::default());

        assert_eq!(ctx.method, "POST");
        assert_eq!(ctx.query_params.get("limit").map(String::as_str), Some("5"));
        assert_eq!(ctx.body.as_deref(), Some(r#"{"name":"Rex"}"#));
        assert!(ctx.bindings.is_empty());
    }
}
