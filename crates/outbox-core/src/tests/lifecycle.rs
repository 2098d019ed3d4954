//! Engine lifecycle: construction, start/stop, observation stream closure.

use super::harness::{fast_engine, message, MockStream};
use crate::{DataStore, InMemoryDataStore, OutboxError, Outboxer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn start_requires_a_check_interval() {
    let mut engine = Outboxer::builder()
        .data_store(Arc::new(InMemoryDataStore::new()) as Arc<dyn DataStore>)
        .event_stream(Arc::new(MockStream::new()))
        .build()
        .unwrap();

    let err = engine.start().unwrap_err();
    assert!(matches!(err, OutboxError::MissingCheckInterval));
}

#[tokio::test]
async fn starting_twice_is_an_error() {
    let mut engine = fast_engine(
        Arc::new(InMemoryDataStore::new()),
        Arc::new(MockStream::new()),
    );

    let _observation = engine.start().unwrap();
    let err = engine.start().unwrap_err();
    assert!(matches!(err, OutboxError::AlreadyRunning));

    engine.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_restart_works() {
    let store = Arc::new(InMemoryDataStore::new());
    let stream = Arc::new(MockStream::new());
    let mut engine = fast_engine(store.clone(), stream.clone());

    let _observation = engine.start().unwrap();
    engine.stop().await;
    engine.stop().await;

    // a fresh start gets fresh observation streams and working loops
    let mut observation = engine.start().unwrap();
    engine.send(message("after restart")).await.unwrap();

    timeout(Duration::from_secs(2), observation.deliveries.recv())
        .await
        .expect("delivery signal")
        .expect("stream open");

    engine.stop().await;
    assert_eq!(stream.sent_count(), 1);
}

#[tokio::test]
async fn observation_streams_close_when_the_engine_stops() {
    let mut engine = fast_engine(
        Arc::new(InMemoryDataStore::new()),
        Arc::new(MockStream::new()),
    );

    let mut observation = engine.start().unwrap();
    engine.stop().await;

    // both senders live inside the loops; once the loops exit the
    // receivers see end-of-stream rather than hanging
    let closed = timeout(Duration::from_secs(2), observation.errors.recv())
        .await
        .expect("errors stream settled");
    assert!(closed.is_none());

    let closed = timeout(Duration::from_secs(2), observation.deliveries.recv())
        .await
        .expect("deliveries stream settled");
    assert!(closed.is_none());
}

#[tokio::test]
async fn a_pending_message_survives_a_stop_start_cycle() {
    let store = Arc::new(InMemoryDataStore::new());
    let stream = Arc::new(MockStream::new());

    // stopped engine: the message just sits in the store
    let mut engine = fast_engine(store.clone(), stream.clone());
    engine.send(message("parked")).await.unwrap();
    assert_eq!(store.get_events(10).await.unwrap().len(), 1);

    let mut observation = engine.start().unwrap();
    timeout(Duration::from_secs(2), observation.deliveries.recv())
        .await
        .expect("delivery signal")
        .expect("stream open");
    engine.stop().await;

    assert!(store.messages().await[0].dispatched);
}
