//! The persistence contract the engine consumes.

use crate::{DynamicValue, OutboxMessage, OutboxResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

/// Executor handed to [`DataStore::add_within_tx`] callbacks.
///
/// Statements issued through it run inside the same transaction as the
/// outbox insert, so the caller's business writes and the message commit
/// or roll back together.
#[async_trait]
pub trait TxExecutor: Send {
    /// Execute one statement with positional bind arguments, returning the
    /// number of affected rows.
    async fn execute(&mut self, query: &str, args: &[DynamicValue]) -> OutboxResult<u64>;
}

/// Callback run inside the outbox insert transaction, before the insert.
pub type TxCallback =
    Box<dyn for<'c> FnOnce(&'c mut dyn TxExecutor) -> BoxFuture<'c, OutboxResult<()>> + Send>;

/// Persistence operations for outbox messages.
///
/// Implementations own the persistent rows exclusively; the engine only
/// holds the messages it has just read, between a read and the
/// corresponding dispatch outcome.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch at most `batch_size` undispatched messages, ascending by id.
    async fn get_events(&self, batch_size: i32) -> OutboxResult<Vec<OutboxMessage>>;

    /// Durably persist a message, assigning its id.
    ///
    /// Called from the producer hot path; must not wait on dispatch
    /// progress.
    async fn add(&self, msg: OutboxMessage) -> OutboxResult<()>;

    /// Run `fn_` and persist `msg` in one transaction.
    ///
    /// The callback runs first; if it fails, the transaction is rolled
    /// back and the message is not persisted.
    async fn add_within_tx(&self, msg: OutboxMessage, fn_: TxCallback) -> OutboxResult<()>;

    /// Atomically set `dispatched = true` and stamp `dispatched_at`.
    ///
    /// Safe to call on an already-dispatched id.
    async fn set_as_dispatched(&self, id: i64) -> OutboxResult<()>;

    /// Delete at most `batch_size` dispatched messages with
    /// `dispatched_at` older than `dispatched_before`.
    async fn remove(&self, dispatched_before: DateTime<Utc>, batch_size: i32) -> OutboxResult<()>;

    /// Release store resources.
    async fn close(&self) -> OutboxResult<()>;
}
