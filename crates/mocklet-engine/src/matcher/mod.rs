//! Resource matcher: evaluates configured rules against a request across
//! independent dimensions and selects the single best match.

pub(crate) mod body_query;

pub use body_query::{evaluate as evaluate_body_query, BodyOperator, BodyQuery, REGEX_CACHE_SIZE};

use crate::behavior::StepConfig;
use crate::cache::BoundedCache;
use crate::config::{EngineConfig, ResponseConfig};
use crate::exchange::Exchange;
use crate::scripting::{RuntimeContext, ScriptEngineRegistry, ScriptSource};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Three-valued per-dimension result. `NoConfig` means the dimension is
/// unset and does not constrain the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    NoConfig,
    ExactMatch,
    NotMatched,
}

/// Path dimension result; a `*`-suffix wildcard or a `:param` template keeps
/// the candidate eligible but is not an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathMatch {
    NoConfig,
    Exact,
    Template,
    Wildcard,
    NotMatched,
}

/// Declarative matching + response configuration for one resource.
///
/// Supplied fully resolved by the configuration loader; read-only during
/// request handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceRule {
    pub path: Option<String>,
    pub method: Option<String>,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub form_params: HashMap<String, String>,
    pub request_headers: HashMap<String, String>,
    /// Compare parameter keys case-insensitively. Header keys are always
    /// case-insensitive.
    pub params_case_insensitive: bool,
    pub body: Option<BodyQuery>,
    /// Inline predicate script; a broken predicate disables the rule rather
    /// than crashing the request.
    pub predicate: Option<ScriptSource>,
    pub response: ResponseConfig,
    pub steps: Vec<StepConfig>,
}

impl ResourceRule {
    fn has_params_config(&self) -> bool {
        !self.path_params.is_empty()
            || !self.query_params.is_empty()
            || !self.form_params.is_empty()
    }
}

struct Candidate<'r> {
    rule: &'r ResourceRule,
    index: usize,
    exact_path: bool,
}

/// Matches requests against resource rules. Matching is a pure read over
/// immutable rules; the only shared mutable state is the bounded
/// compiled-regex cache for body operators.
pub struct ResourceMatcher {
    engines: Arc<ScriptEngineRegistry>,
    regex_cache: BoundedCache<String, Regex>,
}

impl ResourceMatcher {
    pub fn new(engines: Arc<ScriptEngineRegistry>) -> Self {
        Self {
            engines,
            regex_cache: BoundedCache::new(REGEX_CACHE_SIZE),
        }
    }

    /// Return the single best-matching rule for this exchange, or none.
    /// Selection is independent of which route led here: every rule's own
    /// path shape decides its eligibility, so narrowing compares candidates
    /// across exact, templated, and wildcard paths in one pass.
    pub fn find_best_match<'r>(
        &self,
        exchange: &Exchange,
        rules: &'r [ResourceRule],
        config: &EngineConfig,
    ) -> Option<&'r ResourceRule> {
        let mut eligible: Vec<Candidate<'r>> = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            if let Some(candidate) = self.evaluate(rule, index, exchange, config) {
                eligible.push(candidate);
            }
        }

        match eligible.len() {
            0 => None,
            1 => Some(eligible[0].rule),
            _ => Some(self.narrow(eligible, exchange)),
        }
    }

    /// Evaluate one rule across all dimensions; `Some` iff no dimension
    /// yields `NotMatched`.
    fn evaluate<'r>(
        &self,
        rule: &'r ResourceRule,
        index: usize,
        exchange: &Exchange,
        config: &EngineConfig,
    ) -> Option<Candidate<'r>> {
        let request = &exchange.request;

        let path_match = match_path(rule.path.as_deref(), &request.path);
        if path_match == PathMatch::NotMatched {
            return None;
        }

        if match_method(rule.method.as_deref(), &request.method) == MatchOutcome::NotMatched {
            return None;
        }

        let keys_ci = rule.params_case_insensitive;
        for (configured, actual) in [
            (&rule.path_params, &request.path_params),
            (&rule.query_params, &request.query_params),
            (&rule.form_params, &request.form_params),
        ] {
            if match_value_map(configured, actual, keys_ci) == MatchOutcome::NotMatched {
                return None;
            }
        }

        // Header keys are compared case-insensitively
        if match_value_map(&rule.request_headers, &request.headers, true)
            == MatchOutcome::NotMatched
        {
            return None;
        }

        if self.match_body(rule, request.body.as_deref()) == MatchOutcome::NotMatched {
            return None;
        }

        if self.match_predicate(rule, exchange, config) == MatchOutcome::NotMatched {
            return None;
        }

        Some(Candidate {
            rule,
            index,
            exact_path: path_match == PathMatch::Exact,
        })
    }

    fn match_body(&self, rule: &ResourceRule, body: Option<&str>) -> MatchOutcome {
        let Some(query) = &rule.body else {
            return MatchOutcome::NoConfig;
        };
        if query.json_path.is_none() && query.x_path.is_none() {
            return MatchOutcome::NoConfig;
        }
        if evaluate_body_query(query, body, &self.regex_cache) {
            MatchOutcome::ExactMatch
        } else {
            MatchOutcome::NotMatched
        }
    }

    fn match_predicate(
        &self,
        rule: &ResourceRule,
        exchange: &Exchange,
        config: &EngineConfig,
    ) -> MatchOutcome {
        let Some(script) = &rule.predicate else {
            return MatchOutcome::NoConfig;
        };

        let engine = match self.engines.engine_for(&script.lang) {
            Ok(engine) => engine,
            Err(e) => {
                warn!("predicate script '{}' unavailable: {}", script.id, e);
                return MatchOutcome::NotMatched;
            }
        };

        let ctx = RuntimeContext::for_exchange(exchange, config);
        match engine.eval_predicate(&script.id, &ctx) {
            Ok(true) => MatchOutcome::ExactMatch,
            Ok(false) => MatchOutcome::NotMatched,
            Err(e) => {
                warn!(
                    "predicate script '{}' failed, treating as non-match: {}",
                    script.id, e
                );
                MatchOutcome::NotMatched
            }
        }
    }

    /// Specificity narrowing over multiple eligible candidates. Each step
    /// only filters when it would leave the set non-empty.
    fn narrow<'r>(&self, mut candidates: Vec<Candidate<'r>>, exchange: &Exchange) -> &'r ResourceRule {
        retain_if_any(&mut candidates, |c| c.rule.has_params_config());
        retain_if_any(&mut candidates, |c| !c.rule.request_headers.is_empty());
        retain_if_any(&mut candidates, |c| c.rule.predicate.is_some());
        retain_if_any(&mut candidates, |c| c.exact_path);

        if candidates.len() > 1 {
            warn!(
                "ambiguous configuration: {} resources match {} {}; using the first in configuration order",
                candidates.len(),
                exchange.request.method,
                exchange.request.path
            );
        } else {
            debug!(
                "narrowed to resource #{} for {} {}",
                candidates[0].index, exchange.request.method, exchange.request.path
            );
        }
        candidates[0].rule
    }
}

fn retain_if_any<'r>(candidates: &mut Vec<Candidate<'r>>, keep: impl Fn(&Candidate<'r>) -> bool) {
    if candidates.iter().any(&keep) {
        candidates.retain(keep);
    }
}

fn match_path(configured: Option<&str>, request_path: &str) -> PathMatch {
    let Some(configured) = configured else {
        return PathMatch::NoConfig;
    };
    if configured == request_path {
        return PathMatch::Exact;
    }
    if let Some(prefix) = configured.strip_suffix('*') {
        return if request_path.starts_with(prefix) {
            PathMatch::Wildcard
        } else {
            PathMatch::NotMatched
        };
    }
    if template_matches(configured, request_path) {
        return PathMatch::Template;
    }
    PathMatch::NotMatched
}

/// Segment-wise path template match: a `:name` segment matches any single
/// non-empty segment, everything else matches literally.
fn template_matches(template: &str, path: &str) -> bool {
    let mut template_segments = template.split('/');
    let mut path_segments = path.split('/');
    loop {
        match (template_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some(expected), Some(actual)) => {
                if expected.starts_with(':') {
                    if actual.is_empty() {
                        return false;
                    }
                } else if expected != actual {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

fn match_method(configured: Option<&str>, method: &str) -> MatchOutcome {
    match configured {
        None => MatchOutcome::NoConfig,
        Some(m) if m.eq_ignore_ascii_case(method) => MatchOutcome::ExactMatch,
        Some(_) => MatchOutcome::NotMatched,
    }
}

/// Subset constraint over a configured key/value map: every configured key
/// must be present with an equal value; extra request keys are ignored.
fn match_value_map(
    configured: &HashMap<String, String>,
    actual: &HashMap<String, String>,
    keys_case_insensitive: bool,
) -> MatchOutcome {
    if configured.is_empty() {
        return MatchOutcome::NoConfig;
    }

    let key_matches = |expected: &str, actual_key: &str| -> bool {
        if keys_case_insensitive {
            expected.eq_ignore_ascii_case(actual_key)
        } else {
            expected == actual_key
        }
    };

    for (key, expected_value) in configured {
        let found = actual
            .iter()
            .find(|(k, _)| key_matches(key, k))
            .map(|(_, v)| v.as_str());
        match found {
            Some(value) if value == expected_value => {}
            _ => return MatchOutcome::NotMatched,
        }
    }
    MatchOutcome::ExactMatch
}
