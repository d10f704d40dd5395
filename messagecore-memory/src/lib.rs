//! In-memory adapters for the `messagecore` event sourcing library.
//!
//! This crate implements the core's storage ports without a database:
//!
//! - [`InMemoryEventPersistence`] - the events table, with real
//!   transactions (staged writes, commit, rollback, read-your-writes)
//! - [`OutboxBus`] - an event/command bus that enrolls its deliveries in
//!   the store transaction, so outbox atomicity is observable in tests
//! - [`InMemoryAuditLog`] - the processed-message audit log
//! - [`InMemoryMessageLog`] - the durable message log the rebuilder reads
//!
//! Useful for tests and development scenarios where persistence is not
//! required; vendor database adapters live in their own crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod audit;
mod message_log;
mod outbox;
mod store;

pub use audit::InMemoryAuditLog;
pub use message_log::InMemoryMessageLog;
pub use outbox::OutboxBus;
pub use store::{InMemoryEventPersistence, MemoryTransaction};
