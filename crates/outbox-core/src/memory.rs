//! In-memory data store.
//!
//! Keeps the outbox in process memory behind a mutex. Useful for tests
//! and for single-process setups where durability across restarts is not
//! required; it honors the full [`DataStore`] contract, including the
//! transactional callback (statements are accepted and discarded).

use crate::{DataStore, DynamicValue, OutboxMessage, OutboxResult, TxCallback, TxExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

/// In-memory implementation of the data store.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    next_id: i64,
    messages: Vec<OutboxMessage>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            next_id: 1,
            messages: Vec::new(),
        }
    }
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored message, for inspection in tests.
    pub async fn messages(&self) -> Vec<OutboxMessage> {
        self.inner.lock().await.messages.clone()
    }

    /// Number of stored messages, dispatched or not.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn insert(&self, mut msg: OutboxMessage) {
        let mut inner = self.inner.lock().await;
        msg.id = inner.next_id;
        msg.dispatched = false;
        msg.dispatched_at = None;
        inner.next_id += 1;
        inner.messages.push(msg);
    }
}

/// Executor handed to in-memory transactional callbacks.
///
/// There is no SQL engine behind it; statements are accepted so that
/// producer code written against a SQL store runs unchanged.
struct NoopTxExecutor;

#[async_trait]
impl TxExecutor for NoopTxExecutor {
    async fn execute(&mut self, query: &str, _args: &[DynamicValue]) -> OutboxResult<u64> {
        debug!(query, "discarding statement on in-memory store");
        Ok(0)
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_events(&self, batch_size: i32) -> OutboxResult<Vec<OutboxMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| !m.dispatched)
            .take(batch_size.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn add(&self, msg: OutboxMessage) -> OutboxResult<()> {
        self.insert(msg).await;
        Ok(())
    }

    async fn add_within_tx(&self, msg: OutboxMessage, fn_: TxCallback) -> OutboxResult<()> {
        let mut execer = NoopTxExecutor;
        fn_(&mut execer).await?;
        self.insert(msg).await;
        Ok(())
    }

    async fn set_as_dispatched(&self, id: i64) -> OutboxResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(msg) = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id && !m.dispatched)
        {
            msg.dispatched = true;
            msg.dispatched_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn remove(&self, dispatched_before: DateTime<Utc>, batch_size: i32) -> OutboxResult<()> {
        let mut inner = self.inner.lock().await;
        let mut budget = batch_size.max(0) as usize;
        inner.messages.retain(|m| {
            let eligible =
                m.dispatched && m.dispatched_at.is_some_and(|at| at < dispatched_before);
            if eligible && budget > 0 {
                budget -= 1;
                false
            } else {
                true
            }
        });
        Ok(())
    }

    async fn close(&self) -> OutboxResult<()> {
        Ok(())
    }
}
