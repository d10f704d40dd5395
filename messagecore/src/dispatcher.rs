//! The event dispatcher: multi-handler fan-out with two delivery modes.
//!
//! Handlers subscribe to concrete event tags or, via the catch-all
//! registration, to every event. The synchronous mode invokes handlers one
//! after another on the caller's task with no retry; the concurrent mode
//! spawns one task per handler, retries each under the fast schedule, and
//! joins all of them before returning - callers observe a synchronous
//! boundary either way.
//!
//! A concurrency conflict surfacing from a handler in concurrent mode
//! means a sibling already applied the effect: the dispatcher stops
//! retrying and reports success. Handlers must be idempotent across
//! retries.

use crate::errors::{ProcessingError, ProcessingResult};
use crate::message::{Envelope, VersionedEvent};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A handler for versioned events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The event tags this handler subscribes to. An empty list together
    /// with catch-all registration subscribes to everything.
    fn subscribed_tags(&self) -> Vec<&'static str>;

    /// Handles one event delivery. Must be idempotent: the concurrent
    /// dispatcher retries failures, and the rebuilder replays history.
    ///
    /// # Errors
    ///
    /// Any processing failure.
    async fn handle(&self, event: &Envelope<VersionedEvent>) -> ProcessingResult<()>;
}

/// How event deliveries reach their handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Every handler in registration order on the caller's task; no
    /// retry; the first failure propagates immediately.
    Sync,
    /// One task per handler, joined before returning; per-handler bounded
    /// retry; a concurrency conflict counts as success.
    Concurrent,
}

/// Tag-keyed event fan-out shared by both delivery modes.
pub struct EventDispatcher {
    subscriptions: Vec<(Vec<&'static str>, Arc<dyn EventHandler>)>,
    catch_all: Vec<Arc<dyn EventHandler>>,
    mode: DispatchMode,
    retry: RetryConfig,
}

impl EventDispatcher {
    /// Creates a dispatcher in the given mode with the standard dispatch
    /// retry schedule.
    pub fn new(mode: DispatchMode) -> Self {
        Self::with_retry(mode, RetryConfig::event_dispatch())
    }

    /// Creates a dispatcher with an explicit retry schedule (used by the
    /// concurrent mode only).
    pub fn with_retry(mode: DispatchMode, retry: RetryConfig) -> Self {
        Self {
            subscriptions: Vec::new(),
            catch_all: Vec::new(),
            mode,
            retry,
        }
    }

    /// The dispatcher's delivery mode.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Subscribes a handler to the tags it declares. Multiple handlers may
    /// subscribe to the same tag; they are invoked in registration order.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        let tags = handler.subscribed_tags();
        self.subscriptions.push((tags, handler));
    }

    /// Subscribes a handler to every event, after the tag-specific
    /// handlers.
    pub fn register_catch_all(&mut self, handler: Arc<dyn EventHandler>) {
        self.catch_all.push(handler);
    }

    /// Delivers one event to every matching handler.
    ///
    /// # Errors
    ///
    /// In [`DispatchMode::Sync`], the first handler failure. In
    /// [`DispatchMode::Concurrent`], the first failure that survived its
    /// retries - reported only after every handler has finished.
    pub async fn dispatch(&self, event: &Envelope<VersionedEvent>) -> ProcessingResult<()> {
        let tag = event.body.tag.as_str();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscriptions
            .iter()
            .filter(|(tags, _)| tags.iter().any(|t| *t == tag))
            .map(|(_, handler)| Arc::clone(handler))
            .chain(self.catch_all.iter().map(Arc::clone))
            .collect();

        if handlers.is_empty() {
            debug!(tag, "no handlers subscribed; event dropped");
            return Ok(());
        }
        debug!(tag, handlers = handlers.len(), trace = %event.trace_text, "dispatching event");

        match self.mode {
            DispatchMode::Sync => {
                for handler in handlers {
                    handler.handle(event).await?;
                }
                Ok(())
            }
            DispatchMode::Concurrent => {
                let mut tasks = JoinSet::new();
                for handler in handlers {
                    let envelope = event.clone();
                    let retry = self.retry.clone();
                    tasks.spawn(async move {
                        handle_with_retry(handler, envelope, retry).await
                    });
                }

                // Wait for every handler before reporting anything.
                let mut first_error = None;
                while let Some(joined) = tasks.join_next().await {
                    let result = joined.unwrap_or_else(|join_err| {
                        Err(ProcessingError::Handler(format!(
                            "event handler task failed: {join_err}"
                        )))
                    });
                    if let Err(err) = result {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
                match first_error {
                    None => Ok(()),
                    Some(err) => Err(err),
                }
            }
        }
    }
}

async fn handle_with_retry(
    handler: Arc<dyn EventHandler>,
    event: Envelope<VersionedEvent>,
    retry: RetryConfig,
) -> ProcessingResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let delay = retry.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match handler.handle(&event).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_concurrency_conflict() => {
                // A sibling writer got there first: the event's effect is
                // already persisted, so this delivery is done.
                debug!(tag = %event.body.tag, attempt,
                    "concurrency conflict during dispatch; treating as already processed");
                return Ok(());
            }
            Err(err) if attempt >= retry.max_attempts => {
                warn!(tag = %event.body.tag, attempt, error = %err,
                    "event handler failed; retries exhausted");
                return Err(err);
            }
            Err(err) => {
                warn!(tag = %event.body.tag, attempt, error = %err,
                    "event handler failed; will retry");
            }
        }
    }
}
