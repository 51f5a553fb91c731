//! Response resolution: runs a rule's step pipeline and folds the results
//! into one final behavior.

use crate::behavior::{BehaviorType, ProcessingStep, RemoteStep, ResponseBehavior, ScriptStep, StepConfig};
use crate::capture::{BodyCaptureService, CaptureService};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::matcher::ResourceRule;
use crate::scripting::{RuntimeContext, ScriptEngineRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hook invoked before a rule's steps run; may contribute extra bindings
/// visible to scripts under `context.bindings`.
pub trait ScriptBindingsListener: Send + Sync {
    fn on_context(&self, exchange: &Exchange, ctx: &mut RuntimeContext);
}

/// Builds and runs the behavior pipeline for a matched rule.
pub struct ResponseResolver {
    engines: Arc<ScriptEngineRegistry>,
    capture_service: Arc<dyn CaptureService>,
    listeners: Vec<Arc<dyn ScriptBindingsListener>>,
    client: reqwest::Client,
}

impl ResponseResolver {
    pub fn new(engines: Arc<ScriptEngineRegistry>) -> Self {
        Self {
            engines,
            capture_service: Arc::new(BodyCaptureService),
            listeners: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_capture_service(mut self, service: Arc<dyn CaptureService>) -> Self {
        self.capture_service = service;
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ScriptBindingsListener>) {
        self.listeners.push(listener);
    }

    /// Eagerly register every script a rule references, so compile errors
    /// surface at configuration time rather than mid-request. Step IDs must
    /// be unique across the whole configuration.
    pub fn preload(&self, rules: &[ResourceRule]) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for rule in rules {
            for step in &rule.steps {
                if !seen.insert(step.step_id()) {
                    return Err(EngineError::DuplicateStepId(step.step_id().to_string()));
                }
                if let StepConfig::Script { script, .. } = step {
                    self.engines.register_source(script)?;
                }
            }
            if let Some(predicate) = &rule.predicate {
                self.engines.register_source(predicate)?;
            }
        }
        Ok(())
    }

    fn build_steps(&self, rule: &ResourceRule) -> Vec<Arc<dyn ProcessingStep>> {
        rule.steps
            .iter()
            .map(|config| match config {
                StepConfig::Script { step_id, script } => Arc::new(ScriptStep::new(
                    step_id.clone(),
                    script.clone(),
                    Arc::clone(&self.engines),
                )) as Arc<dyn ProcessingStep>,
                StepConfig::Remote {
                    step_id,
                    call,
                    captures,
                } => Arc::new(RemoteStep::new(
                    step_id.clone(),
                    call.clone(),
                    captures.clone(),
                    self.client.clone(),
                    Arc::clone(&self.capture_service),
                )) as Arc<dyn ProcessingStep>,
            })
            .collect()
    }

    /// Run the rule's steps in order and fold their partial behaviors, later
    /// steps winning for the fields they set. Unless a step short-circuited,
    /// the rule's declared response config fills in whatever is left. Any
    /// requested delay is served here, before the behavior is returned.
    pub async fn resolve(
        &self,
        exchange: &Exchange,
        rule: &ResourceRule,
        config: &EngineConfig,
    ) -> anyhow::Result<ResponseBehavior> {
        let mut ctx = RuntimeContext::for_exchange(exchange, config);
        for listener in &self.listeners {
            listener.on_context(exchange, &mut ctx);
        }

        let mut behavior = ResponseBehavior::new();
        for step in self.build_steps(rule) {
            let mut next = step.execute(exchange, &mut ctx).await?;
            next.fill_from(&behavior);
            behavior = next;
        }

        match behavior.behavior_type() {
            BehaviorType::ShortCircuit => {
                debug!("step pipeline short-circuited, skipping declared defaults");
            }
            BehaviorType::Default => behavior.merge_defaults(&rule.response),
        }

        // Random draw happens before the await: thread-local RNG handles
        // are not Send
        if let Some(performance) = &behavior.performance {
            let delay_ms = performance.delay_ms();
            if delay_ms > 0 {
                debug!(delay_ms, "delaying response");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        Ok(behavior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PerformanceSimulation, ResponseConfig};
    use crate::exchange::HttpRequest;
    use crate::scripting::ScriptSource;
    use std::time::Instant;

    fn resolver() -> ResponseResolver {
        ResponseResolver::new(Arc::new(ScriptEngineRegistry::with_builtin()))
    }

    fn exchange() -> Exchange {
        Exchange::new(HttpRequest::new("GET", "/pets"))
    }

    fn script_rule(id: &str, code: &str) -> ResourceRule {
        ResourceRule {
            steps: vec![StepConfig::Script {
                step_id: format!("{id}-step"),
                script: ScriptSource::rhai(id, code),
            }],
            ..ResourceRule::default()
        }
    }

    #[tokio::test]
    async fn test_no_steps_yields_declared_response() {
        let rule = ResourceRule {
            response: ResponseConfig {
                status_code: Some(201),
                content: Some("created".to_string()),
                ..ResponseConfig::default()
            },
            ..ResourceRule::default()
        };

        let behavior = resolver()
            .resolve(&exchange(), &rule, &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(behavior.status_code, Some(201));
        assert_eq!(behavior.content.as_deref(), Some("created"));
    }

    #[tokio::test]
    async fn test_script_values_override_declared_defaults() {
        let mut rule = script_rule("override", r#"#{statusCode: 418, content: "teapot"}"#);
        rule.response.status_code = Some(200);
        rule.response.content = Some("declared".to_string());
        rule.response
            .headers
            .insert("X-Declared".to_string(), "yes".to_string());

        let resolver = resolver();
        resolver.preload(std::slice::from_ref(&rule)).unwrap();

        let behavior = resolver
            .resolve(&exchange(), &rule, &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(behavior.status_code, Some(418));
        assert_eq!(behavior.content.as_deref(), Some("teapot"));
        // Declared headers still fill in around script values
        assert_eq!(
            behavior.headers.get("X-Declared").map(String::as_str),
            Some("yes")
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_declared_defaults() {
        let mut rule = script_rule(
            "short",
            r#"#{statusCode: 204, shortCircuit: true}"#,
        );
        rule.response.content = Some("declared".to_string());

        let resolver = resolver();
        resolver.preload(std::slice::from_ref(&rule)).unwrap();

        let behavior = resolver
            .resolve(&exchange(), &rule, &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(behavior.behavior_type(), BehaviorType::ShortCircuit);
        assert_eq!(behavior.status_code, Some(204));
        assert_eq!(behavior.content, None);
    }

    #[tokio::test]
    async fn test_later_step_wins_earlier_fills() {
        let rule = ResourceRule {
            steps: vec![
                StepConfig::Script {
                    step_id: "first".to_string(),
                    script: ScriptSource::rhai(
                        "chain-first",
                        r#"#{statusCode: 200, content: "from first"}"#,
                    ),
                },
                StepConfig::Script {
                    step_id: "second".to_string(),
                    script: ScriptSource::rhai("chain-second", r#"#{statusCode: 503}"#),
                },
            ],
            ..ResourceRule::default()
        };

        let resolver = resolver();
        resolver.preload(std::slice::from_ref(&rule)).unwrap();

        let behavior = resolver
            .resolve(&exchange(), &rule, &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(behavior.status_code, Some(503));
        assert_eq!(behavior.content.as_deref(), Some("from first"));
    }

    #[tokio::test]
    async fn test_duplicate_step_id_rejected_at_preload() {
        let rule = ResourceRule {
            steps: vec![
                StepConfig::Script {
                    step_id: "dup".to_string(),
                    script: ScriptSource::rhai("dup-a", "#{}"),
                },
                StepConfig::Script {
                    step_id: "dup".to_string(),
                    script: ScriptSource::rhai("dup-b", "#{}"),
                },
            ],
            ..ResourceRule::default()
        };

        let err = resolver().preload(std::slice::from_ref(&rule));
        assert!(matches!(err, Err(EngineError::DuplicateStepId(id)) if id == "dup"));
    }

    #[tokio::test]
    async fn test_preload_surfaces_script_compile_error() {
        let rule = script_rule("broken", "if {");
        let err = resolver().preload(std::slice::from_ref(&rule));
        assert!(matches!(err, Err(EngineError::ScriptLoad { .. })));
    }

    #[tokio::test]
    async fn test_exact_delay_is_served() {
        let mut rule = ResourceRule::default();
        rule.response.performance = Some(PerformanceSimulation::Exact { exact_delay_ms: 30 });

        let started = Instant::now();
        resolver()
            .resolve(&exchange(), &rule, &EngineConfig::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_listener_bindings_visible_to_scripts() {
        struct TenantListener;
        impl ScriptBindingsListener for TenantListener {
            fn on_context(&self, _exchange: &Exchange, ctx: &mut RuntimeContext) {
                ctx.bindings.insert("tenant".to_string(), "acme".into());
            }
        }

        let rule = script_rule(
            "read-binding",
            r#"#{content: context.bindings.tenant}"#,
        );
        let mut resolver = resolver();
        resolver.add_listener(Arc::new(TenantListener));
        resolver.preload(std::slice::from_ref(&rule)).unwrap();

        let behavior = resolver
            .resolve(&exchange(), &rule, &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(behavior.content.as_deref(), Some("acme"));
    }
}
