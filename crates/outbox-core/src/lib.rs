//! Transactional outbox engine.
//!
//! Producers durably record outgoing messages in a local store — in the
//! same transaction as their business writes when needed — and a
//! background dispatcher relays them to an event stream with
//! at-least-once semantics.
//!
//! This crate provides:
//! - `OutboxMessage` and `DynamicValues`: the message model and its
//!   serializable option/header maps
//! - `DataStore` / `EventStream`: the contracts stores and stream
//!   adapters implement
//! - `InMemoryDataStore`: an in-process store backend
//! - `Outboxer`: the engine with its dispatcher and cleanup loops
//! - `lock`: advisory-lock id derivation shared by the SQL backends
//!
//! # Core invariants
//!
//! 1. **Publish-then-mark**: a message is marked dispatched only after a
//!    successful publish; a crash in between causes redelivery, never loss
//! 2. **No silent loss**: cleanup removes only dispatched rows older than
//!    the configured cutoff
//! 3. **Idempotent mark**: recording dispatch twice is a no-op
//! 4. **Retries by omission**: a failed publish leaves the row
//!    undispatched; the next tick picks it up again

mod error;
mod memory;
mod message;
mod outboxer;
mod store;
mod stream;

pub mod lock;

#[cfg(test)]
mod tests;

pub use error::{BoxedSource, OutboxError, OutboxResult};
pub use memory::InMemoryDataStore;
pub use message::{DynamicValue, DynamicValues, OutboxMessage};
pub use outboxer::{Observation, Outboxer, OutboxerBuilder};
pub use store::{DataStore, TxCallback, TxExecutor};
pub use stream::EventStream;
