//! Response behavior model: the resolved description of what to send back.

mod resolver;
mod steps;

pub use resolver::{ResponseResolver, ScriptBindingsListener};
pub use steps::{ProcessingStep, RemoteCallConfig, RemoteStep, ScriptStep, StepConfig};

pub(crate) use steps::expand_context_placeholders;

use crate::config::{FailureType, PerformanceSimulation, ResponseConfig};
use crate::error::EngineError;
use std::collections::HashMap;

/// Whether a behavior follows the rule's declared defaults or skips them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BehaviorType {
    /// Fill in missing values from the resource's declared response config.
    #[default]
    Default,
    /// Skip the rule's normal default response logic (typically set by a
    /// script).
    ShortCircuit,
}

impl BehaviorType {
    fn label(self) -> &'static str {
        match self {
            BehaviorType::Default => "default",
            BehaviorType::ShortCircuit => "shortCircuit",
        }
    }
}

/// Mutable result object built during response resolution.
///
/// Created per request; discarded once the exchange completes. The behavior
/// type may be set at most once per resolution.
#[derive(Debug, Clone, Default)]
pub struct ResponseBehavior {
    behavior_type: BehaviorType,
    behavior_type_set: bool,
    pub status_code: Option<u16>,
    pub content: Option<String>,
    pub file: Option<String>,
    pub template: bool,
    pub example_name: Option<String>,
    pub headers: HashMap<String, String>,
    pub performance: Option<PerformanceSimulation>,
    pub failure: Option<FailureType>,
}

impl ResponseBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    /// A behavior carrying only a status code, used when a step substitutes
    /// an error response.
    pub fn with_status(status: u16) -> Self {
        Self {
            status_code: Some(status),
            ..Self::default()
        }
    }

    pub fn behavior_type(&self) -> BehaviorType {
        self.behavior_type
    }

    /// Set the behavior type. Setting it a second time is a usage error.
    pub fn set_behavior_type(&mut self, behavior_type: BehaviorType) -> Result<(), EngineError> {
        if self.behavior_type_set {
            return Err(EngineError::BehaviorTypeAlreadySet {
                current: self.behavior_type.label().to_string(),
                attempted: behavior_type.label().to_string(),
            });
        }
        self.behavior_type = behavior_type;
        self.behavior_type_set = true;
        Ok(())
    }

    /// Fill in values this behavior has not set from another behavior
    /// produced earlier in the step chain.
    pub fn fill_from(&mut self, earlier: &ResponseBehavior) {
        if self.status_code.is_none() {
            self.status_code = earlier.status_code;
        }
        if self.content.is_none() {
            self.content = earlier.content.clone();
        }
        if self.file.is_none() {
            self.file = earlier.file.clone();
        }
        if !self.template {
            self.template = earlier.template;
        }
        if self.example_name.is_none() {
            self.example_name = earlier.example_name.clone();
        }
        for (name, value) in &earlier.headers {
            self.headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        if self.performance.is_none() {
            self.performance = earlier.performance.clone();
        }
        if self.failure.is_none() {
            self.failure = earlier.failure;
        }
        if !self.behavior_type_set && earlier.behavior_type_set {
            self.behavior_type = earlier.behavior_type;
            self.behavior_type_set = true;
        }
    }

    /// Fill in defaults from the resource's declared response configuration.
    /// Values a script has already set are never overwritten.
    pub fn merge_defaults(&mut self, config: &ResponseConfig) {
        if self.status_code.is_none() {
            self.status_code = Some(config.status_code.unwrap_or(200));
        }
        if self.content.is_none() {
            self.content = config.content.clone();
        }
        if self.file.is_none() {
            self.file = config.file.clone();
        }
        if !self.template {
            self.template = config.template;
        }
        if self.example_name.is_none() {
            self.example_name = config.example_name.clone();
        }
        for (name, value) in &config.headers {
            self.headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        if self.performance.is_none() {
            self.performance = config.performance.clone();
        }
        if self.failure.is_none() {
            self.failure = config.failure;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_type_set_once() {
        let mut behavior = ResponseBehavior::new();
        behavior
            .set_behavior_type(BehaviorType::ShortCircuit)
            .unwrap();
        let err = behavior.set_behavior_type(BehaviorType::Default);
        assert!(matches!(
            err,
            Err(EngineError::BehaviorTypeAlreadySet { .. })
        ));
        assert_eq!(behavior.behavior_type(), BehaviorType::ShortCircuit);
    }

    #[test]
    fn test_merge_defaults_does_not_overwrite() {
        let mut behavior = ResponseBehavior::new();
        behavior.status_code = Some(201);
        behavior
            .headers
            .insert("Content-Type".to_string(), "application/json".to_string());

        let mut config = ResponseConfig::default();
        config.status_code = Some(404);
        config.content = Some("declared body".to_string());
        config
            .headers
            .insert("Content-Type".to_string(), "text/plain".to_string());
        config
            .headers
            .insert("X-Extra".to_string(), "yes".to_string());

        behavior.merge_defaults(&config);

        assert_eq!(behavior.status_code, Some(201));
        assert_eq!(behavior.content.as_deref(), Some("declared body"));
        assert_eq!(
            behavior.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(
            behavior.headers.get("X-Extra").map(String::as_str),
            Some("yes")
        );
    }

    #[test]
    fn test_merge_defaults_fills_200_when_unset() {
        let mut behavior = ResponseBehavior::new();
        behavior.merge_defaults(&ResponseConfig::default());
        assert_eq!(behavior.status_code, Some(200));
    }

    #[test]
    fn test_fill_from_prefers_later_values() {
        let mut earlier = ResponseBehavior::new();
        earlier.status_code = Some(200);
        earlier.content = Some("from step one".to_string());

        let mut later = ResponseBehavior::new();
        later.status_code = Some(503);
        later.fill_from(&earlier);

        assert_eq!(later.status_code, Some(503));
        assert_eq!(later.content.as_deref(), Some("from step one"));
    }
}
