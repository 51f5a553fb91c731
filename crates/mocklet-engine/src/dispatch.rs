//! Dispatch loop: resolves a request to routes, runs their handlers, and
//! applies status-keyed error handlers before the response goes out.

use crate::behavior::ResponseResolver;
use crate::config::{EngineConfig, ExecutionMode};
use crate::error::EngineError;
use crate::exchange::{Exchange, ExchangePhase};
use crate::matcher::{ResourceMatcher, ResourceRule};
use crate::router::{Route, RouteHandler, RouteTable};
use crate::scripting::ScriptEngineRegistry;
use crate::sender::SendPipeline;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Invoked when a completed exchange carries the status code the handler is
/// registered for. May call [`Exchange::complete`] again to replace the
/// response.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, exchange: &mut Exchange) -> anyhow::Result<()>;
}

/// Route handler backed by the full set of registered resource rules. Rule
/// selection runs over every rule in one matcher invocation, so specificity
/// narrowing compares rules across configured paths no matter which route
/// led here. Leaves the exchange untouched when no rule matches, so dispatch
/// falls through to less specific routes.
struct ResourceHandler {
    rules: Arc<Vec<ResourceRule>>,
    matcher: Arc<ResourceMatcher>,
    resolver: Arc<ResponseResolver>,
    pipeline: Arc<SendPipeline>,
    config: Arc<EngineConfig>,
}

#[async_trait]
impl RouteHandler for ResourceHandler {
    async fn handle(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let Some(rule) = self
            .matcher
            .find_best_match(exchange, &self.rules, &self.config)
        else {
            return Ok(());
        };

        let behavior = self.resolver.resolve(exchange, rule, &self.config).await?;
        self.pipeline.send_response(exchange, &behavior).await
    }
}

/// The engine front door: owns the route table and the matching, resolution,
/// and sending machinery.
pub struct Dispatcher {
    route_table: RouteTable,
    matcher: Arc<ResourceMatcher>,
    resolver: Arc<ResponseResolver>,
    pipeline: Arc<SendPipeline>,
    engines: Arc<ScriptEngineRegistry>,
    error_handlers: HashMap<u16, Arc<dyn ErrorHandler>>,
    config: Arc<EngineConfig>,
}

impl Dispatcher {
    /// Builds a dispatcher on the process-wide script engine registry, so
    /// every dispatcher in the process shares one set of engines and
    /// registered scripts. Use [`Dispatcher::with_parts`] for an isolated
    /// stack.
    pub fn new(config: EngineConfig) -> Self {
        let engines = crate::scripting::global_registry();
        Self::with_parts(
            config.clone(),
            Arc::clone(&engines),
            Arc::new(ResourceMatcher::new(Arc::clone(&engines))),
            Arc::new(ResponseResolver::new(engines)),
            Arc::new(SendPipeline::new(config)),
        )
    }

    pub fn with_parts(
        config: EngineConfig,
        engines: Arc<ScriptEngineRegistry>,
        matcher: Arc<ResourceMatcher>,
        resolver: Arc<ResponseResolver>,
        pipeline: Arc<SendPipeline>,
    ) -> Self {
        Self {
            route_table: RouteTable::new(),
            matcher,
            resolver,
            pipeline,
            engines,
            error_handlers: HashMap::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn script_engines(&self) -> &Arc<ScriptEngineRegistry> {
        &self.engines
    }

    /// Register an error handler for one response status code. Later
    /// registrations for the same status replace earlier ones.
    pub fn set_error_handler(&mut self, status: u16, handler: Arc<dyn ErrorHandler>) {
        self.error_handlers.insert(status, handler);
    }

    /// Register a custom route directly.
    pub fn register_route(&mut self, route: Route) {
        self.route_table.register(route);
        if self.config.prioritize_exact_routes {
            self.route_table.sort_by_specificity();
        }
    }

    /// Register resource rules: scripts are preloaded and each distinct
    /// path/method pair becomes one route. Every route's handler holds the
    /// whole rule set so that one matcher invocation sees every candidate
    /// rule, whatever path shape it was configured with. Re-registering the
    /// same path/method replaces the previous route.
    pub fn register_resources(&mut self, rules: Vec<ResourceRule>) -> Result<(), EngineError> {
        self.resolver.preload(&rules)?;

        let mut keys: Vec<(Option<String>, Option<String>)> = Vec::new();
        for rule in &rules {
            let key = (rule.path.clone(), rule.method.clone());
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        let rules = Arc::new(rules);

        for (path, method) in keys {
            let handler = Arc::new(ResourceHandler {
                rules: Arc::clone(&rules),
                matcher: Arc::clone(&self.matcher),
                resolver: Arc::clone(&self.resolver),
                pipeline: Arc::clone(&self.pipeline),
                config: Arc::clone(&self.config),
            });
            let route = match path {
                None => Route::catch_all(method, handler),
                Some(path) => match path.strip_suffix('*') {
                    // Wildcard paths become anchored prefix regex routes
                    Some(prefix) => Route::new(
                        None,
                        Some(format!("{}.*", regex::escape(prefix))),
                        method,
                        handler,
                    )?,
                    None => Route::for_path(path, method, handler)?,
                },
            };
            self.route_table.register(route);
        }

        if self.config.prioritize_exact_routes {
            self.route_table.sort_by_specificity();
        }
        Ok(())
    }

    /// Entry point for a transport adapter. In async execution mode the
    /// dispatch runs on a spawned task; the exchange moves with it and comes
    /// back completed.
    pub async fn handle(self: &Arc<Self>, mut exchange: Exchange) -> Exchange {
        match self.config.execution_mode {
            ExecutionMode::Sync => {
                self.dispatch(&mut exchange).await;
                exchange
            }
            ExecutionMode::Async => {
                let dispatcher = Arc::clone(self);
                let task = tokio::spawn(async move {
                    dispatcher.dispatch(&mut exchange).await;
                    exchange
                });
                match task.await {
                    Ok(exchange) => exchange,
                    Err(e) => {
                        error!("dispatch task panicked: {e}");
                        let mut exchange = Exchange::new(crate::exchange::HttpRequest::new("", ""));
                        exchange.set_status_code(500);
                        exchange.complete(Bytes::new());
                        exchange
                    }
                }
            }
        }
    }

    /// Run one exchange through the loop: route matching, handlers in
    /// specificity order, failure conversion, not-found fallback, and
    /// status-keyed error handlers.
    pub async fn dispatch(&self, exchange: &mut Exchange) {
        let routes = self
            .route_table
            .match_routes(&exchange.request.path, &exchange.request.method);

        let only_catch_all = routes.iter().all(|route| route.is_catch_all());
        if routes.is_empty() || only_catch_all {
            debug!(
                path = %exchange.request.path,
                "no specific route, sending not-found"
            );
            if let Err(e) = self.pipeline.send_not_found(exchange) {
                exchange.fail(e);
            }
        } else {
            // Bind template parameters from every matched route up front;
            // on a name collision the most specific route wins.
            for route in &routes {
                for (name, value) in route.extract_path_params(&exchange.request.path) {
                    exchange.request.path_params.entry(name).or_insert(value);
                }
            }

            for route in &routes {
                if let Err(e) = route.handler().handle(exchange).await {
                    exchange.fail(e);
                }
                if exchange.is_failed() || exchange.phase() == ExchangePhase::ResponseSent {
                    break;
                }
            }
        }

        if exchange.is_failed() {
            exchange.set_status_code(500);
            exchange.complete(Bytes::new());
        } else if exchange.phase() != ExchangePhase::ResponseSent {
            // Every handler passed without completing the exchange
            if let Err(e) = self.pipeline.send_not_found(exchange) {
                exchange.fail(e);
                exchange.set_status_code(500);
                exchange.complete(Bytes::new());
            }
        }

        self.run_error_handler(exchange).await;
    }

    async fn run_error_handler(&self, exchange: &mut Exchange) {
        let status = exchange.status_code();
        if status < 400 {
            return;
        }

        // A registered handler owns the status; only unhandled codes get
        // logged here.
        if let Some(handler) = self.error_handlers.get(&status) {
            debug!(status, "running error handler");
            if let Err(e) = handler.handle(exchange).await {
                warn!(status, "error handler failed: {e:#}");
            }
            return;
        }

        match exchange.failure_cause() {
            Some(cause) => error!(
                status,
                method = %exchange.request.method,
                path = %exchange.request.path,
                "request failed: {cause:#}"
            ),
            None => warn!(
                status,
                method = %exchange.request.method,
                path = %exchange.request.path,
                "request completed with error status"
            ),
        }
    }
}
