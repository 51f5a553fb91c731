//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the matching and resolution engine.
///
/// Handler and script failures travel as `anyhow::Error` and are recorded on
/// the exchange rather than propagated; this enum covers configuration and
/// usage errors that callers must handle explicitly.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A route template reused the same `:name` placeholder twice.
    #[error("duplicate path parameter ':{name}' in route template '{template}'")]
    DuplicatePathParam { name: String, template: String },

    /// A route declared both a path template and a regex.
    #[error("route cannot set both a path template ('{template}') and a regex ('{regex}')")]
    ConflictingRouteMatch { template: String, regex: String },

    /// A regex route carried an invalid pattern.
    #[error("invalid route regex '{pattern}'")]
    InvalidRouteRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// `ResponseBehavior::set_behavior_type` was called twice in one resolution.
    #[error("behavior type already set to '{current}' (attempted '{attempted}')")]
    BehaviorTypeAlreadySet { current: String, attempted: String },

    /// Response data was read before the exchange reached `ResponseSent`.
    #[error("response data is not readable until the response has been sent")]
    ResponseNotSent,

    /// Two processing steps in the configuration share a step ID.
    #[error("duplicate step id '{0}' in configuration")]
    DuplicateStepId(String),

    /// A script referenced by the configuration failed to load or compile.
    #[error("script '{script_id}' failed to load")]
    ScriptLoad {
        script_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// No script engine is registered for the requested language.
    #[error("no script engine registered for language '{0}'")]
    NoScriptEngine(String),
}
