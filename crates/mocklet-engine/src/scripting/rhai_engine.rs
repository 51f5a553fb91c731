//! Built-in Rhai script engine.

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use std::collections::HashMap;
use std::sync::Arc;

use super::{RuntimeContext, ScriptEngine, ScriptLoggers};
use crate::behavior::{BehaviorType, ResponseBehavior};
use crate::config::{FailureType, PerformanceSimulation};

/// Rhai engine: scripts are compiled once at registration and the cached AST
/// is evaluated per request with a fresh scope.
pub struct RhaiScriptEngine {
    scripts: RwLock<HashMap<String, Arc<AST>>>,
    loggers: ScriptLoggers,
}

impl RhaiScriptEngine {
    pub fn new() -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
            loggers: ScriptLoggers::default(),
        }
    }

    fn ast_for(&self, id: &str) -> Result<Arc<AST>> {
        self.scripts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("script '{id}' is not registered"))
    }

    /// Build an engine with the per-script logger functions installed.
    fn create_engine(&self, script_id: &str) -> Engine {
        let mut engine = Engine::new();

        let logger = self.loggers.logger_for(script_id);
        {
            let logger = logger.clone();
            engine.register_fn("log_debug", move |msg: &str| logger.debug(msg));
        }
        {
            let logger = logger.clone();
            engine.register_fn("log_info", move |msg: &str| logger.info(msg));
        }
        {
            let logger = logger.clone();
            engine.register_fn("log_warn", move |msg: &str| logger.warn(msg));
        }
        engine.register_fn("log_error", move |msg: &str| logger.error(msg));

        engine
    }

    fn eval(&self, id: &str, ctx: &RuntimeContext) -> Result<Dynamic> {
        let ast = self.ast_for(id)?;
        let engine = self.create_engine(id);
        let mut scope = Scope::new();
        scope.push("context", build_context_map(ctx));

        engine
            .eval_ast_with_scope(&mut scope, ast.as_ref())
            .map_err(|e| anyhow!("script '{id}' execution error: {e}"))
    }
}

impl Default for RhaiScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for RhaiScriptEngine {
    fn lang(&self) -> &str {
        "rhai"
    }

    fn register_script(&self, id: &str, code: &str) -> Result<()> {
        let engine = self.create_engine(id);
        let ast = engine
            .compile(code)
            .map_err(|e| anyhow!("failed to compile script '{id}': {e}"))?;
        self.scripts
            .write()
            .insert(id.to_string(), Arc::new(ast));
        Ok(())
    }

    fn execute(&self, id: &str, ctx: &RuntimeContext) -> Result<ResponseBehavior> {
        let result = self.eval(id, ctx)?;
        parse_behavior(id, result)
    }

    fn eval_predicate(&self, id: &str, ctx: &RuntimeContext) -> Result<bool> {
        let result = self.eval(id, ctx)?;
        result
            .as_bool()
            .map_err(|actual| anyhow!("predicate script '{id}' must return a boolean, got {actual}"))
    }
}

fn string_map_to_dynamic(map: &HashMap<String, String>) -> Dynamic {
    let mut out = Map::new();
    for (k, v) in map {
        out.insert(k.clone().into(), Dynamic::from(v.clone()));
    }
    Dynamic::from(out)
}

/// Build the `context` scope variable: request data, environment, plugin
/// config, and step/listener bindings.
fn build_context_map(ctx: &RuntimeContext) -> Map {
    let mut request = Map::new();
    request.insert("method".into(), Dynamic::from(ctx.method.clone()));
    request.insert("path".into(), Dynamic::from(ctx.path.clone()));
    request.insert("pathParams".into(), string_map_to_dynamic(&ctx.path_params));
    request.insert(
        "queryParams".into(),
        string_map_to_dynamic(&ctx.query_params),
    );
    request.insert("formParams".into(), string_map_to_dynamic(&ctx.form_params));
    request.insert("headers".into(), string_map_to_dynamic(&ctx.headers));
    request.insert(
        "body".into(),
        ctx.body
            .as_ref()
            .map(|b| Dynamic::from(b.clone()))
            .unwrap_or(Dynamic::UNIT),
    );

    let mut bindings = Map::new();
    for (k, v) in &ctx.bindings {
        bindings.insert(k.clone().into(), json_to_dynamic(v.clone()));
    }

    let mut context = Map::new();
    context.insert("request".into(), Dynamic::from(request));
    context.insert("env".into(), string_map_to_dynamic(&ctx.env));
    context.insert("config".into(), json_to_dynamic(ctx.plugin_config.clone()));
    context.insert("bindings".into(), Dynamic::from(bindings));
    context
}

/// Interpret a script result as a response behavior.
///
/// Scripts return either unit (keep the rule's defaults) or a map with any of
/// `statusCode`, `content`, `file`, `template`, `exampleName`, `headers`,
/// `shortCircuit`, `delayMs`, `minDelayMs`/`maxDelayMs`, `failureType`.
fn parse_behavior(id: &str, result: Dynamic) -> Result<ResponseBehavior> {
    let mut behavior = ResponseBehavior::new();
    if result.is_unit() {
        return Ok(behavior);
    }

    let map = result
        .try_cast::<Map>()
        .ok_or_else(|| anyhow!("script '{id}' must return a map or unit"))?;

    if let Some(short_circuit) = map.get("shortCircuit").and_then(|v| v.as_bool().ok()) {
        if short_circuit {
            behavior.set_behavior_type(BehaviorType::ShortCircuit)?;
        }
    }

    if let Some(status) = map.get("statusCode").and_then(|v| v.as_int().ok()) {
        behavior.status_code = Some(status as u16);
    }
    if let Some(content) = get_string(&map, "content") {
        behavior.content = Some(content);
    }
    if let Some(file) = get_string(&map, "file") {
        behavior.file = Some(file);
    }
    if let Some(template) = map.get("template").and_then(|v| v.as_bool().ok()) {
        behavior.template = template;
    }
    if let Some(example) = get_string(&map, "exampleName") {
        behavior.example_name = Some(example);
    }

    if let Some(headers) = map.get("headers").and_then(|v| v.clone().try_cast::<Map>()) {
        for (name, value) in headers {
            let value = value
                .clone()
                .try_cast::<String>()
                .unwrap_or_else(|| value.to_string());
            behavior.headers.insert(name.to_string(), value);
        }
    }

    if let Some(delay) = map.get("delayMs").and_then(|v| v.as_int().ok()) {
        behavior.performance = Some(PerformanceSimulation::Exact {
            exact_delay_ms: delay.max(0) as u64,
        });
    } else if let (Some(min), Some(max)) = (
        map.get("minDelayMs").and_then(|v| v.as_int().ok()),
        map.get("maxDelayMs").and_then(|v| v.as_int().ok()),
    ) {
        behavior.performance = Some(PerformanceSimulation::Range {
            min_delay_ms: min.max(0) as u64,
            max_delay_ms: max.max(0) as u64,
        });
    }

    if let Some(failure) = get_string(&map, "failureType") {
        behavior.failure = match failure.as_str() {
            "closeConnection" => Some(FailureType::CloseConnection),
            "emptyResponse" => Some(FailureType::EmptyResponse),
            other => return Err(anyhow!("script '{id}' set unknown failureType '{other}'")),
        };
    }

    Ok(behavior)
}

fn get_string(map: &Map, key: &str) -> Option<String> {
    map.get(key).and_then(|v| v.clone().try_cast::<String>())
}

/// Convert a JSON value into a Rhai dynamic.
pub(crate) fn json_to_dynamic(value: serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s),
        serde_json::Value::Array(items) => {
            let array: rhai::Array = items.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(array)
        }
        serde_json::Value::Object(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}
