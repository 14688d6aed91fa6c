use async_trait::async_trait;
use protocol::config::TimeoutConfig;
use protocol::{JsonObject, SharedDir};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Failure reported by a handler. `line` points into a script when the
/// failure came from one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub line: Option<u32>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(message: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

#[derive(Debug, Clone)]
pub struct ScriptSettings {
    pub interpreter: String,
    pub args: Vec<String>,
    pub max_output_bytes: usize,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            interpreter: "sh".to_string(),
            args: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// What a handler may touch while it runs.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub dir: SharedDir,
    pub timeouts: TimeoutConfig,
    pub scripts: ScriptSettings,
    pub tool_names: Vec<String>,
}

impl HandlerContext {
    pub fn new(dir: SharedDir) -> Self {
        Self {
            dir,
            timeouts: TimeoutConfig::default(),
            scripts: ScriptSettings::default(),
            tool_names: Vec::new(),
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, args: JsonObject) -> Result<Value, HandlerError>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler already registered under `tool`.
    pub fn register(&mut self, tool: impl Into<String>, handler: impl CommandHandler + 'static) {
        let tool = tool.into();
        if self.handlers.insert(tool.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(tool = %tool, "handler replaced");
        }
    }

    pub fn get(&self, tool: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(tool).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Value);

    #[async_trait]
    impl CommandHandler for Fixed {
        async fn handle(&self, _ctx: &HandlerContext, _args: JsonObject) -> Result<Value, HandlerError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn registry_routes_by_tool_name() {
        let mut registry = HandlerRegistry::new();
        registry.register("b", Fixed(json!("second")));
        registry.register("a", Fixed(json!("first")));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);

        let ctx = HandlerContext::new(SharedDir::new("/tmp/unused"));
        let handler = registry.get("a").expect("handler");
        let value = handler.handle(&ctx, JsonObject::new()).await.expect("handle");
        assert_eq!(value, json!("first"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn anyhow_errors_keep_their_context_chain() {
        let err = anyhow::anyhow!("disk full").context("failed to save project");
        let handler_err = HandlerError::from(err);
        assert_eq!(handler_err.message, "failed to save project: disk full");
        assert!(handler_err.line.is_none());
    }
}
