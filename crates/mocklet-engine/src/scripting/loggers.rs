//! Per-script loggers, cached in a bounded map.

use crate::cache::BoundedCache;
use std::sync::Arc;

/// A logger scoped to one script source, attached to scripts as their `log`
/// binding.
pub struct ScriptLogger {
    script_id: String,
}

impl ScriptLogger {
    fn new(script_id: String) -> Self {
        Self { script_id }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(script = %self.script_id, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(script = %self.script_id, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(script = %self.script_id, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(script = %self.script_id, "{message}");
    }
}

/// Bounded cache of per-script loggers; multiple in-flight requests share it.
pub struct ScriptLoggers {
    cache: BoundedCache<String, Arc<ScriptLogger>>,
}

impl ScriptLoggers {
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: BoundedCache::new(max_size),
        }
    }

    pub fn logger_for(&self, script_id: &str) -> Arc<ScriptLogger> {
        let id = script_id.to_string();
        self.cache
            .get_or_compute(id.clone(), || Some(Arc::new(ScriptLogger::new(id))))
            // The compute closure always returns Some
            .unwrap_or_else(|| Arc::new(ScriptLogger::new(script_id.to_string())))
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for ScriptLoggers {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_cache_reuses_instances() {
        let loggers = ScriptLoggers::new(8);
        let a = loggers.logger_for("pets.rhai");
        let b = loggers.logger_for("pets.rhai");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loggers.len(), 1);
    }

    #[test]
    fn test_logger_cache_is_bounded() {
        let loggers = ScriptLoggers::new(2);
        for i in 0..5 {
            loggers.logger_for(&format!("script-{i}"));
        }
        assert_eq!(loggers.len(), 2);
    }
}
