//! The processing worker and its control surface.
//!
//! The worker owns the command processor, the event dispatcher, and the
//! in-memory bus, and drives processing rounds: within a round, queued
//! commands are handled before queued events, one message end to end at a
//! time. Messages produced while handling land on the bus and are picked
//! up next round.
//!
//! The control actions - status, start, stop, rebuild - are plain
//! methods; protocol framing (HTTP, RPC, CLI) belongs to an external
//! collaborator.

use crate::bus::InMemoryMessageBus;
use crate::dispatcher::EventDispatcher;
use crate::errors::{ProcessingError, ProcessingResult, RebuildError};
use crate::processor::CommandProcessor;
use crate::rebuild::{EventStoreRebuilder, RebuildReport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const IDLE_BACKOFF: Duration = Duration::from_millis(25);

/// Whether the worker is accepting processing rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Not processing; `start` begins.
    Stopped,
    /// Processing rounds are running.
    Running,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// External collaborator that rebuilds read models; the worker only
/// forwards the control action.
#[async_trait]
pub trait ReadModelRebuilder: Send + Sync {
    /// Rebuilds every read model from the event store.
    ///
    /// # Errors
    ///
    /// Any processing failure; surfaced to the control caller.
    async fn rebuild(&self) -> ProcessingResult<()>;
}

/// In-process message worker.
pub struct Worker {
    processor: CommandProcessor,
    dispatcher: EventDispatcher,
    bus: Arc<InMemoryMessageBus>,
    running: AtomicBool,
    read_models: Option<Arc<dyn ReadModelRebuilder>>,
}

impl Worker {
    /// Creates a worker over the given processor, dispatcher, and bus.
    pub fn new(
        processor: CommandProcessor,
        dispatcher: EventDispatcher,
        bus: Arc<InMemoryMessageBus>,
    ) -> Self {
        Self {
            processor,
            dispatcher,
            bus,
            running: AtomicBool::new(false),
            read_models: None,
        }
    }

    /// Attaches the read-model rebuild collaborator.
    #[must_use]
    pub fn with_read_model_rebuilder(mut self, rebuilder: Arc<dyn ReadModelRebuilder>) -> Self {
        self.read_models = Some(rebuilder);
        self
    }

    /// The worker's current status.
    pub fn status(&self) -> WorkerStatus {
        if self.running.load(Ordering::SeqCst) {
            WorkerStatus::Running
        } else {
            WorkerStatus::Stopped
        }
    }

    /// Allows processing rounds to run. [`run`](Self::run) drives them.
    pub fn start(&self) {
        info!("worker started");
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stops processing after the current round.
    pub fn stop(&self) {
        info!("worker stopping");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs one processing round: every queued command, then every queued
    /// event. Returns the number of messages handled.
    ///
    /// # Errors
    ///
    /// The first processing failure; remaining queue contents stay queued.
    pub async fn run_round(&self) -> ProcessingResult<usize> {
        let mut handled = 0;
        for command in self.bus.drain_commands() {
            self.processor.process_message(&command).await?;
            handled += 1;
        }
        for event in self.bus.drain_events() {
            self.dispatcher.dispatch(&event).await?;
            handled += 1;
        }
        if handled > 0 {
            debug!(handled, "processing round complete");
        }
        Ok(handled)
    }

    /// Drives processing rounds until [`stop`](Self::stop) is called,
    /// idling briefly when the queues are empty.
    ///
    /// # Errors
    ///
    /// The first processing failure stops the worker and surfaces.
    pub async fn run(&self) -> ProcessingResult<()> {
        while self.running.load(Ordering::SeqCst) {
            let handled = match self.run_round().await {
                Ok(handled) => handled,
                Err(err) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            };
            if handled == 0 {
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
        }
        Ok(())
    }

    /// Control action: stop processing and rebuild the event store from
    /// the message log. The processor and dispatcher are rebuild-dedicated
    /// instances wired to the rebuilder's enlisted persistence.
    ///
    /// # Errors
    ///
    /// Any [`RebuildError`] from the rebuild run.
    pub async fn rebuild_event_store(
        &self,
        rebuilder: &EventStoreRebuilder,
        processor: CommandProcessor,
        dispatcher: EventDispatcher,
    ) -> Result<RebuildReport, RebuildError> {
        self.stop();
        rebuilder.rebuild(processor, dispatcher).await
    }

    /// Control action: rebuild read models via the attached collaborator.
    ///
    /// # Errors
    ///
    /// [`ProcessingError::Handler`] when no collaborator is attached, or
    /// whatever the collaborator raises.
    pub async fn rebuild_read_models(&self) -> ProcessingResult<()> {
        match &self.read_models {
            Some(rebuilder) => rebuilder.rebuild().await,
            None => Err(ProcessingError::Handler(
                "no read-model rebuilder is attached".to_string(),
            )),
        }
    }
}
