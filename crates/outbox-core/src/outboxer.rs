//! The outbox engine: producer API plus the dispatcher and cleanup loops.

use crate::{DataStore, EventStream, OutboxError, OutboxMessage, OutboxResult, TxExecutor};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the observation streams.
///
/// Kept at one slot so a slow consumer stalls the dispatcher instead of
/// letting signals pile up; consumers that drop their receiver simply stop
/// receiving, without stalling anything.
const OBSERVATION_BUFFER: usize = 1;

/// Default number of messages fetched per dispatcher tick.
const MESSAGE_BATCH_SIZE: i32 = 100;

/// Default number of rows purged per cleanup tick.
const CLEAN_UP_BATCH_SIZE: i32 = 100;

/// Receivers for the engine's background-loop outcomes.
///
/// `errors` carries one [`OutboxError`] per failed background operation;
/// `deliveries` carries the id of every message that was published and
/// recorded as dispatched. Both close when the engine stops.
#[derive(Debug)]
pub struct Observation {
    pub errors: mpsc::Receiver<OutboxError>,
    pub deliveries: mpsc::Receiver<i64>,
}

/// The outbox engine.
///
/// Composes a [`DataStore`] and an [`EventStream`]; producers write
/// through [`send`](Outboxer::send) / [`send_within_tx`](Outboxer::send_within_tx),
/// and the background dispatcher relays persisted messages to the stream,
/// marking each one dispatched only after a successful publish.
pub struct Outboxer {
    data_store: Arc<dyn DataStore>,
    event_stream: Arc<dyn EventStream>,
    check_interval: Duration,
    clean_up_interval: Option<Duration>,
    clean_up_before: Option<DateTime<Utc>>,
    clean_up_older_than: chrono::Duration,
    clean_up_batch_size: i32,
    message_batch_size: i32,
    runtime: Option<Running>,
}

impl std::fmt::Debug for Outboxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outboxer")
            .field("check_interval", &self.check_interval)
            .field("clean_up_interval", &self.clean_up_interval)
            .field("clean_up_before", &self.clean_up_before)
            .field("clean_up_older_than", &self.clean_up_older_than)
            .field("clean_up_batch_size", &self.clean_up_batch_size)
            .field("message_batch_size", &self.message_batch_size)
            .field("running", &self.runtime.is_some())
            .finish()
    }
}

struct Running {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Outboxer {
    pub fn builder() -> OutboxerBuilder {
        OutboxerBuilder::default()
    }

    /// Persist a message for asynchronous delivery.
    ///
    /// Returns once the store accepted the message; does not wait for the
    /// publish.
    pub async fn send(&self, msg: OutboxMessage) -> OutboxResult<()> {
        self.data_store.add(msg).await
    }

    /// Persist a message in the same transaction as the caller's writes.
    ///
    /// The callback runs before the outbox insert; statements it issues
    /// through the executor commit or roll back together with the message.
    pub async fn send_within_tx<F>(&self, msg: OutboxMessage, fn_: F) -> OutboxResult<()>
    where
        F: for<'c> FnOnce(&'c mut dyn TxExecutor) -> BoxFuture<'c, OutboxResult<()>>
            + Send
            + 'static,
    {
        self.data_store.add_within_tx(msg, Box::new(fn_)).await
    }

    /// Launch the dispatcher and, when a cleanup interval is configured,
    /// the cleanup loop.
    ///
    /// Returns the observation streams for this run. Fails with
    /// [`OutboxError::AlreadyRunning`] when the loops are already up and
    /// with [`OutboxError::MissingCheckInterval`] when no poll period was
    /// configured.
    pub fn start(&mut self) -> OutboxResult<Observation> {
        if self.runtime.is_some() {
            return Err(OutboxError::AlreadyRunning);
        }

        if self.check_interval.is_zero() {
            return Err(OutboxError::MissingCheckInterval);
        }

        let token = CancellationToken::new();
        let (err_tx, errors) = mpsc::channel(OBSERVATION_BUFFER);
        let (ok_tx, deliveries) = mpsc::channel(OBSERVATION_BUFFER);

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(run_dispatcher(
            self.data_store.clone(),
            self.event_stream.clone(),
            token.clone(),
            self.check_interval,
            self.message_batch_size,
            err_tx.clone(),
            ok_tx,
        )));

        if let Some(clean_up_interval) = self.clean_up_interval {
            tasks.push(tokio::spawn(run_cleanup(
                self.data_store.clone(),
                token.clone(),
                clean_up_interval,
                self.clean_up_before,
                self.clean_up_older_than,
                self.clean_up_batch_size,
                err_tx,
            )));
        }

        info!(
            check_interval_ms = self.check_interval.as_millis() as u64,
            cleanup = self.clean_up_interval.is_some(),
            "outboxer started"
        );

        self.runtime = Some(Running { token, tasks });
        Ok(Observation { errors, deliveries })
    }

    /// Stop the background loops and wait for them to exit.
    ///
    /// The observation streams close once both loops are down. Calling
    /// `stop` on an engine that is not running is a no-op.
    pub async fn stop(&mut self) {
        if let Some(running) = self.runtime.take() {
            running.token.cancel();
            for task in running.tasks {
                let _ = task.await;
            }
            info!("outboxer stopped");
        }
    }
}

impl Drop for Outboxer {
    fn drop(&mut self) {
        if let Some(running) = &self.runtime {
            running.token.cancel();
        }
    }
}

/// Builder for [`Outboxer`].
pub struct OutboxerBuilder {
    data_store: Option<Arc<dyn DataStore>>,
    event_stream: Option<Arc<dyn EventStream>>,
    check_interval: Duration,
    clean_up_interval: Option<Duration>,
    clean_up_before: Option<DateTime<Utc>>,
    clean_up_older_than: chrono::Duration,
    clean_up_batch_size: i32,
    message_batch_size: i32,
}

impl Default for OutboxerBuilder {
    fn default() -> Self {
        Self {
            data_store: None,
            event_stream: None,
            check_interval: Duration::ZERO,
            clean_up_interval: None,
            clean_up_before: None,
            clean_up_older_than: chrono::Duration::days(5),
            clean_up_batch_size: CLEAN_UP_BATCH_SIZE,
            message_batch_size: MESSAGE_BATCH_SIZE,
        }
    }
}

impl OutboxerBuilder {
    /// Set the store where messages are persisted before delivery.
    pub fn data_store(mut self, ds: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(ds);
        self
    }

    /// Set the stream messages are delivered to.
    pub fn event_stream(mut self, es: Arc<dyn EventStream>) -> Self {
        self.event_stream = Some(es);
        self
    }

    /// Set how often the dispatcher polls for new messages.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Enable cleanup and set how often it runs.
    pub fn clean_up_interval(mut self, interval: Duration) -> Self {
        self.clean_up_interval = Some(interval);
        self
    }

    /// Purge dispatched messages older than this absolute instant.
    ///
    /// Takes precedence over [`clean_up_older_than`](Self::clean_up_older_than).
    pub fn clean_up_before(mut self, before: DateTime<Utc>) -> Self {
        self.clean_up_before = Some(before);
        self
    }

    /// Purge dispatched messages older than this age (default 5 days).
    pub fn clean_up_older_than(mut self, age: chrono::Duration) -> Self {
        self.clean_up_older_than = age;
        self
    }

    /// Set how many rows each cleanup tick purges (default 100).
    pub fn clean_up_batch_size(mut self, size: i32) -> Self {
        self.clean_up_batch_size = size;
        self
    }

    /// Set how many messages each dispatcher tick fetches (default 100).
    pub fn message_batch_size(mut self, size: i32) -> Self {
        self.message_batch_size = size;
        self
    }

    pub fn build(self) -> OutboxResult<Outboxer> {
        let data_store = self.data_store.ok_or(OutboxError::MissingDataStore)?;
        let event_stream = self.event_stream.ok_or(OutboxError::MissingEventStream)?;

        Ok(Outboxer {
            data_store,
            event_stream,
            check_interval: self.check_interval,
            clean_up_interval: self.clean_up_interval,
            clean_up_before: self.clean_up_before,
            clean_up_older_than: self.clean_up_older_than,
            clean_up_batch_size: self.clean_up_batch_size,
            message_batch_size: self.message_batch_size,
            runtime: None,
        })
    }
}

/// Race a background operation against cancellation.
///
/// Dropping the operation's future on cancellation is what aborts
/// in-flight I/O where the underlying client supports it.
async fn with_cancel<T>(
    token: &CancellationToken,
    fut: impl Future<Output = OutboxResult<T>>,
) -> OutboxResult<T> {
    tokio::select! {
        _ = token.cancelled() => Err(OutboxError::Cancelled),
        res = fut => res,
    }
}

/// Emit on an observation stream, blocking while the consumer is behind.
/// A dropped receiver discards the signal.
async fn emit<T>(tx: &mpsc::Sender<T>, value: T) {
    let _ = tx.send(value).await;
}

async fn run_dispatcher(
    data_store: Arc<dyn DataStore>,
    event_stream: Arc<dyn EventStream>,
    token: CancellationToken,
    check_interval: Duration,
    batch_size: i32,
    err_tx: mpsc::Sender<OutboxError>,
    ok_tx: mpsc::Sender<i64>,
) {
    let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("dispatcher loop started");

    'ticks: loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let events = match with_cancel(&token, data_store.get_events(batch_size)).await {
            Ok(events) => events,
            Err(OutboxError::Cancelled) => break,
            Err(err) => {
                warn!(error = %err, "failed to fetch undispatched messages");
                emit(&err_tx, err).await;
                continue;
            }
        };

        for event in events {
            let message_id = event.id;

            match with_cancel(&token, event_stream.send(&event)).await {
                Ok(()) => {}
                Err(OutboxError::Cancelled) => break 'ticks,
                Err(err) => {
                    warn!(message_id, error = %err, "publish failed, message stays undispatched");
                    emit(&err_tx, err).await;
                    continue;
                }
            }

            // Published. Only now may the message be marked dispatched; a
            // failure here leaves it undispatched and a later tick will
            // publish it again.
            match with_cancel(&token, data_store.set_as_dispatched(message_id)).await {
                Ok(()) => {
                    debug!(message_id, "message dispatched");
                    emit(&ok_tx, message_id).await;
                }
                Err(OutboxError::Cancelled) => break 'ticks,
                Err(err) => {
                    warn!(message_id, error = %err, "failed to record dispatch, message will be republished");
                    emit(&err_tx, err).await;
                }
            }
        }
    }

    debug!("dispatcher loop stopped");
}

async fn run_cleanup(
    data_store: Arc<dyn DataStore>,
    token: CancellationToken,
    clean_up_interval: Duration,
    clean_up_before: Option<DateTime<Utc>>,
    clean_up_older_than: chrono::Duration,
    batch_size: i32,
    err_tx: mpsc::Sender<OutboxError>,
) {
    let mut ticker = interval_at(Instant::now() + clean_up_interval, clean_up_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("cleanup loop started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cutoff = clean_up_before.unwrap_or_else(|| Utc::now() - clean_up_older_than);

        match with_cancel(&token, data_store.remove(cutoff, batch_size)).await {
            Ok(()) => debug!(%cutoff, "cleanup tick completed"),
            Err(OutboxError::Cancelled) => break,
            Err(err) => {
                warn!(%cutoff, error = %err, "cleanup failed");
                emit(&err_tx, err).await;
            }
        }
    }

    debug!("cleanup loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryDataStore;

    #[test]
    fn build_requires_a_data_store() {
        let err = Outboxer::builder().build().unwrap_err();
        assert!(matches!(err, OutboxError::MissingDataStore));
    }

    #[test]
    fn build_requires_an_event_stream() {
        let err = Outboxer::builder()
            .data_store(Arc::new(InMemoryDataStore::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, OutboxError::MissingEventStream));
    }
}
