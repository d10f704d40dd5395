//! The in-process command processor.
//!
//! Handlers declare the command tags they handle and are registered once
//! at startup; the registry is immutable afterwards. Dispatch looks the
//! handler up by the payload's tag, invokes it under a bounded retry, and
//! then invokes the optional catch-all handlers (used for auditing) under
//! the same retry policy.

use crate::errors::{ProcessingError, ProcessingResult, RegistrationError};
use crate::message::{CommandEnvelope, Envelope};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A handler for one or more command tags.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// The command tags this handler processes. Evaluated once, at
    /// registration.
    fn handled_tags(&self) -> Vec<&'static str>;

    /// Handles one command delivery. Handlers must be idempotent: the
    /// processor retries failures, and the rebuilder replays history.
    ///
    /// # Errors
    ///
    /// Any processing failure; the processor retries up to its bound and
    /// then surfaces the final error.
    async fn handle(&self, command: &Envelope<CommandEnvelope>) -> ProcessingResult<()>;
}

/// Type-keyed command dispatch with bounded retry.
pub struct CommandProcessor {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
    catch_all: Vec<Arc<dyn CommandHandler>>,
    retry: RetryConfig,
}

impl CommandProcessor {
    /// Creates a processor with the standard command retry schedule.
    pub fn new() -> Self {
        Self::with_retry(RetryConfig::command_processing())
    }

    /// Creates a processor with an explicit retry schedule.
    pub fn with_retry(retry: RetryConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            catch_all: Vec::new(),
            retry,
        }
    }

    /// Registers a handler for every tag it declares.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateHandler`] when any declared tag is
    /// already registered. Registration errors are fatal at startup.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) -> Result<(), RegistrationError> {
        for tag in handler.handled_tags() {
            if self.handlers.contains_key(tag) {
                return Err(RegistrationError::DuplicateHandler {
                    tag: tag.to_string(),
                });
            }
            self.handlers.insert(tag, Arc::clone(&handler));
        }
        Ok(())
    }

    /// Registers a handler that runs after the specific handler for every
    /// command, e.g. an audit-log writer.
    pub fn register_catch_all(&mut self, handler: Arc<dyn CommandHandler>) {
        self.catch_all.push(handler);
    }

    /// Whether a handler is registered for the given tag.
    pub fn handles(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Processes one command: specific handler first, then the catch-all
    /// handlers, each under the bounded retry policy.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::NoHandler`] when the tag is unregistered, or the
    /// final attempt's error once retries are exhausted.
    pub async fn process_message(
        &self,
        command: &Envelope<CommandEnvelope>,
    ) -> ProcessingResult<()> {
        let tag = command.body.tag.as_str();
        let handler = self
            .handlers
            .get(tag)
            .ok_or_else(|| ProcessingError::NoHandler {
                tag: tag.to_string(),
            })?;
        debug!(tag, trace = %command.trace_text, "processing command");
        self.invoke_with_retry(handler.as_ref(), command).await?;

        for handler in &self.catch_all {
            self.invoke_with_retry(handler.as_ref(), command).await?;
        }
        Ok(())
    }

    async fn invoke_with_retry(
        &self,
        handler: &dyn CommandHandler,
        command: &Envelope<CommandEnvelope>,
    ) -> ProcessingResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match handler.handle(command).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= self.retry.max_attempts => {
                    warn!(tag = %command.body.tag, attempt, error = %err,
                        "command handler failed; retries exhausted");
                    return Err(err);
                }
                Err(err) => {
                    warn!(tag = %command.body.tag, attempt, error = %err,
                        "command handler failed; will retry");
                }
            }
        }
    }
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}
