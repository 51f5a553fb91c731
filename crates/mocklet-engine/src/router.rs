//! Route table: registration, path/placeholder matching, parameter extraction.

use crate::error::EngineError;
use crate::exchange::Exchange;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Specificity penalty applied to regex routes so they sort after any
/// template route.
const REGEX_SPECIFICITY_PENALTY: usize = 1000;

/// Catch-all routes sort after everything else.
const CATCH_ALL_SPECIFICITY_PENALTY: usize = 1_000_000;

/// A request handler bound to a route.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, exchange: &mut Exchange) -> anyhow::Result<()>;
}

/// Adapter for plain synchronous closures, mostly useful in tests and small
/// deployments.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> RouteHandler for FnHandler<F>
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        (self.0)(exchange)
    }
}

struct CompiledTemplate {
    pattern: Regex,
    param_names: Vec<String>,
}

/// A registered route: a path template or regex (or neither, for catch-all),
/// an optional method, and a bound handler.
pub struct Route {
    path_template: Option<String>,
    regex: Option<String>,
    method: Option<String>,
    handler: Arc<dyn RouteHandler>,
    compiled_template: OnceCell<CompiledTemplate>,
    compiled_regex: OnceCell<Option<Regex>>,
}

impl Route {
    /// Create a route. Validates that at most one of template/regex is set,
    /// that a declared regex compiles, and that a template does not reuse a
    /// placeholder name.
    pub fn new(
        path_template: Option<String>,
        regex: Option<String>,
        method: Option<String>,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<Self, EngineError> {
        if let (Some(template), Some(pattern)) = (&path_template, &regex) {
            return Err(EngineError::ConflictingRouteMatch {
                template: template.clone(),
                regex: pattern.clone(),
            });
        }

        if let Some(pattern) = &regex {
            Regex::new(pattern).map_err(|source| EngineError::InvalidRouteRegex {
                pattern: pattern.clone(),
                source,
            })?;
        }

        if let Some(template) = &path_template {
            let mut seen = Vec::new();
            for name in scan_placeholders(template) {
                if seen.contains(&name) {
                    return Err(EngineError::DuplicatePathParam {
                        name,
                        template: template.clone(),
                    });
                }
                seen.push(name);
            }
        }

        Ok(Self {
            path_template,
            regex,
            method,
            handler,
            compiled_template: OnceCell::new(),
            compiled_regex: OnceCell::new(),
        })
    }

    /// A route with a path template and optional method.
    pub fn for_path(
        template: impl Into<String>,
        method: Option<String>,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<Self, EngineError> {
        Self::new(Some(template.into()), None, method, handler)
    }

    /// A catch-all route: matches every path.
    pub fn catch_all(method: Option<String>, handler: Arc<dyn RouteHandler>) -> Self {
        Self {
            path_template: None,
            regex: None,
            method,
            handler,
            compiled_template: OnceCell::new(),
            compiled_regex: OnceCell::new(),
        }
    }

    pub fn path_template(&self) -> Option<&str> {
        self.path_template.as_deref()
    }

    pub fn regex(&self) -> Option<&str> {
        self.regex.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn handler(&self) -> &Arc<dyn RouteHandler> {
        &self.handler
    }

    pub fn is_catch_all(&self) -> bool {
        self.path_template.is_none() && self.regex.is_none()
    }

    /// Registration identity: routes with an equal signature replace each
    /// other on re-registration.
    pub fn signature(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        (
            self.path_template.as_deref(),
            self.regex.as_deref(),
            self.method.as_deref(),
        )
    }

    /// Whether this route matches the given concrete path and method.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        if let Some(route_method) = &self.method {
            if !route_method.eq_ignore_ascii_case(method) {
                return false;
            }
        }

        if let Some(template) = &self.path_template {
            if template == path {
                return true;
            }
            return self
                .compiled(template)
                .map(|compiled| compiled.pattern.is_match(path))
                .unwrap_or(false);
        }

        if let Some(pattern) = &self.regex {
            return self
                .compiled_regex(pattern)
                .map(|re| re.is_match(path))
                .unwrap_or(false);
        }

        // Catch-all matches every path
        true
    }

    /// Extract placeholder values from a concrete path. Empty when the path
    /// does not match the compiled template (or the route has none).
    pub fn extract_path_params(&self, path: &str) -> HashMap<String, String> {
        let Some(template) = &self.path_template else {
            return HashMap::new();
        };
        let Some(compiled) = self.compiled(template) else {
            return HashMap::new();
        };
        let Some(captures) = compiled.pattern.captures(path) else {
            return HashMap::new();
        };

        compiled
            .param_names
            .iter()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect()
    }

    /// Specificity score: lower is more specific. Exact literal paths score
    /// zero, each placeholder adds one, regex routes sort after templates,
    /// catch-alls sort last.
    pub fn specificity_score(&self) -> usize {
        if self.is_catch_all() {
            return CATCH_ALL_SPECIFICITY_PENALTY;
        }
        if self.regex.is_some() {
            return REGEX_SPECIFICITY_PENALTY;
        }
        self.path_template
            .as_deref()
            .map(|t| scan_placeholders(t).len())
            .unwrap_or(0)
    }

    fn compiled(&self, template: &str) -> Option<&CompiledTemplate> {
        self.compiled_template
            .get_or_try_init(|| compile_template(template))
            .map_err(|e| warn!("failed to compile path template '{}': {}", template, e))
            .ok()
    }

    fn compiled_regex(&self, pattern: &str) -> Option<&Regex> {
        self.compiled_regex
            .get_or_init(|| {
                // Anchor so the regex must match the full path
                Regex::new(&format!("^(?:{pattern})$"))
                    .map_err(|e| warn!("failed to compile route regex '{}': {}", pattern, e))
                    .ok()
            })
            .as_ref()
    }
}

/// Scan a template for `:identifier` placeholders. An identifier is a letter
/// followed by letters, digits, or underscores.
fn scan_placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_alphabetic() {
            let start = i + 1;
            let mut end = start + 1;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            names.push(template[start..end].to_string());
            i = end;
        } else {
            i += 1;
        }
    }
    names
}

/// Compile a template into an anchored pattern with one named capture per
/// placeholder; literal segments are escaped.
fn compile_template(template: &str) -> Result<CompiledTemplate, regex::Error> {
    let mut pattern = String::from("^");
    let mut param_names = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    let mut literal_start = 0;

    while i < bytes.len() {
        if bytes[i] == b':' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_alphabetic() {
            pattern.push_str(&regex::escape(&template[literal_start..i]));
            let start = i + 1;
            let mut end = start + 1;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            let name = &template[start..end];
            pattern.push_str(&format!("(?P<{name}>[^/]+)"));
            param_names.push(name.to_string());
            i = end;
            literal_start = end;
        } else {
            i += 1;
        }
    }
    pattern.push_str(&regex::escape(&template[literal_start..]));
    pattern.push('$');

    Ok(CompiledTemplate {
        pattern: Regex::new(&pattern)?,
        param_names,
    })
}

/// Stores registered routes and resolves requests to candidate routes.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. An existing non-catch-all route with an identical
    /// `(path, regex, method)` signature is removed first, so the last
    /// registration wins across configuration reloads.
    pub fn register(&mut self, route: Route) {
        if !route.is_catch_all() {
            let signature = route.signature();
            self.routes
                .retain(|existing| existing.is_catch_all() || existing.signature() != signature);
        }
        self.routes.push(Arc::new(route));
    }

    /// All routes matching the given path and method, in table order.
    pub fn match_routes(&self, path: &str, method: &str) -> Vec<Arc<Route>> {
        self.routes
            .iter()
            .filter(|route| route.matches(path, method))
            .cloned()
            .collect()
    }

    /// Stable-sort routes so exact literal paths are tried before templated
    /// paths, which in turn come before regex routes.
    pub fn sort_by_specificity(&mut self) {
        self.routes
            .sort_by_key(|route| route.specificity_score());
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
