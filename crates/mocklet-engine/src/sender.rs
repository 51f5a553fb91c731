//! Response sending: turns a resolved behavior into the bytes on the
//! exchange, walking a fallback chain of senders.

use crate::behavior::{expand_context_placeholders, ResponseBehavior};
use crate::config::{EngineConfig, FailureType};
use crate::exchange::Exchange;
use crate::scripting::RuntimeContext;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Produces a response body for a behavior, or passes when the behavior
/// carries nothing this sender handles. The pipeline tries senders in order
/// and takes the first body produced.
#[async_trait]
pub trait ResponseSender: Send + Sync {
    fn name(&self) -> &str;

    async fn body_for(
        &self,
        behavior: &ResponseBehavior,
        config: &EngineConfig,
    ) -> anyhow::Result<Option<SenderOutput>>;
}

/// A produced body plus the content type inferred for it, if any.
pub struct SenderOutput {
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl SenderOutput {
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            content_type: None,
        }
    }

    pub fn with_content_type(body: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            body,
            content_type: Some(content_type.into()),
        }
    }
}

/// Hook run after the response is populated but before the transport writes
/// it; may still mutate the exchange.
pub trait BeforeEndHook: Send + Sync {
    fn before_end(&self, exchange: &mut Exchange);
}

/// Serves a configured response file, relative to the engine's response file
/// directory. Content type is inferred from the file extension.
pub struct FileSender;

#[async_trait]
impl ResponseSender for FileSender {
    fn name(&self) -> &str {
        "file"
    }

    async fn body_for(
        &self,
        behavior: &ResponseBehavior,
        config: &EngineConfig,
    ) -> anyhow::Result<Option<SenderOutput>> {
        let Some(file) = &behavior.file else {
            return Ok(None);
        };
        let path = config.response_file_dir.join(file);
        let bytes = tokio::fs::read(&path).await?;
        let mut output = SenderOutput::new(Bytes::from(bytes));
        output.content_type = content_type_for_extension(&path);
        Ok(Some(output))
    }
}

/// Serves inline configured content.
pub struct ContentSender;

#[async_trait]
impl ResponseSender for ContentSender {
    fn name(&self) -> &str {
        "content"
    }

    async fn body_for(
        &self,
        behavior: &ResponseBehavior,
        _config: &EngineConfig,
    ) -> anyhow::Result<Option<SenderOutput>> {
        Ok(behavior
            .content
            .as_ref()
            .map(|content| SenderOutput::new(Bytes::from(content.clone()))))
    }
}

/// Terminal sender: always produces an empty body.
pub struct EmptySender;

#[async_trait]
impl ResponseSender for EmptySender {
    fn name(&self) -> &str {
        "empty"
    }

    async fn body_for(
        &self,
        _behavior: &ResponseBehavior,
        _config: &EngineConfig,
    ) -> anyhow::Result<Option<SenderOutput>> {
        Ok(Some(SenderOutput::new(Bytes::new())))
    }
}

fn content_type_for_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    let content_type = match ext.to_ascii_lowercase().as_str() {
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        _ => return None,
    };
    Some(content_type.to_string())
}

/// Walks the sender chain for a resolved behavior and finalizes the exchange.
pub struct SendPipeline {
    senders: Vec<Arc<dyn ResponseSender>>,
    before_end: Vec<Arc<dyn BeforeEndHook>>,
    config: EngineConfig,
}

impl SendPipeline {
    /// A pipeline with the built-in file/content/empty chain.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            senders: vec![
                Arc::new(FileSender),
                Arc::new(ContentSender),
                Arc::new(EmptySender),
            ],
            before_end: Vec::new(),
            config,
        }
    }

    /// Install a custom sender ahead of the built-in chain.
    pub fn prepend_sender(&mut self, sender: Arc<dyn ResponseSender>) {
        self.senders.insert(0, sender);
    }

    pub fn add_before_end_hook(&mut self, hook: Arc<dyn BeforeEndHook>) {
        self.before_end.push(hook);
    }

    /// Populate the exchange's response from the behavior and complete it.
    ///
    /// A sender error falls through to the next sender in the chain; the
    /// terminal empty sender guarantees the exchange is always completed
    /// (unless the behavior closes the connection).
    pub async fn send_response(
        &self,
        exchange: &mut Exchange,
        behavior: &ResponseBehavior,
    ) -> anyhow::Result<()> {
        exchange.set_status_code(behavior.status_code.unwrap_or(200));
        for (name, value) in &behavior.headers {
            exchange.set_response_header(name.clone(), value.clone());
        }

        match behavior.failure {
            Some(FailureType::CloseConnection) => {
                debug!("failure simulation: closing connection");
                exchange.close_connection();
                return Ok(());
            }
            Some(FailureType::EmptyResponse) => {
                debug!("failure simulation: empty response");
                return self.finalize(exchange, Bytes::new());
            }
            None => {}
        }

        for sender in &self.senders {
            match sender.body_for(behavior, &self.config).await {
                Ok(Some(output)) => {
                    let body = if behavior.template {
                        self.render_template(exchange, output.body)
                    } else {
                        output.body
                    };
                    if let Some(content_type) = output.content_type {
                        exchange.set_response_header_if_absent("Content-Type", content_type);
                    }
                    return self.finalize(exchange, body);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(sender = sender.name(), "sender failed, trying next: {e:#}");
                }
            }
        }

        // Unreachable with the built-in chain installed
        self.finalize(exchange, Bytes::new())
    }

    /// The built-in plain-text not-found response.
    pub fn send_not_found(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.set_status_code(404);
        exchange.set_response_header_if_absent("Content-Type", "text/plain");
        self.finalize(exchange, Bytes::from(self.config.not_found_message.clone()))
    }

    fn render_template(&self, exchange: &Exchange, body: Bytes) -> Bytes {
        let Ok(text) = std::str::from_utf8(&body) else {
            warn!("template body is not valid UTF-8, serving as-is");
            return body;
        };
        let ctx = RuntimeContext::for_exchange(exchange, &self.config);
        Bytes::from(expand_context_placeholders(text, &ctx))
    }

    fn finalize(&self, exchange: &mut Exchange, body: Bytes) -> anyhow::Result<()> {
        exchange.complete(body);
        for hook in &self.before_end {
            hook.before_end(exchange);
        }
        Ok(())
    }
}
