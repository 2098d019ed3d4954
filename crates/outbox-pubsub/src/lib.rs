//! Google Cloud Pub/Sub event stream adapter.
//!
//! Resolves the topic per message (the topic name is a message option,
//! not adapter state) and awaits the server-assigned message id, so a
//! successful send means the broker accepted the message.

use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::Client;
use outbox_core::{DynamicValues, EventStream, OutboxError, OutboxMessage, OutboxResult};
use tracing::debug;

/// The topic name option.
pub const TOPIC_NAME_OPTION: &str = "topic_name";

/// The ordering key option.
pub const ORDERING_KEY_OPTION: &str = "ordering_key";

/// Pub/Sub implementation of the event stream.
pub struct PubSubEventStream {
    client: Client,
}

impl PubSubEventStream {
    /// Create an adapter over a configured Pub/Sub client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventStream for PubSubEventStream {
    async fn send(&self, msg: &OutboxMessage) -> OutboxResult<()> {
        let plan = PublishPlan::from_values(&msg.options)?;

        let topic = self.client.topic(&plan.topic_name);
        let mut publisher = topic.new_publisher(None);

        let awaiter = publisher
            .publish(PubsubMessage {
                data: msg.payload.clone().into(),
                ordering_key: plan.ordering_key.clone().unwrap_or_default(),
                ..Default::default()
            })
            .await;

        let published = awaiter.get().await;
        publisher.shutdown().await;

        let server_id = published.map_err(OutboxError::publish)?;

        debug!(
            message_id = msg.id,
            topic = %plan.topic_name,
            server_id = %server_id,
            "message published"
        );

        Ok(())
    }
}

#[derive(Debug, PartialEq)]
struct PublishPlan {
    topic_name: String,
    ordering_key: Option<String>,
}

impl PublishPlan {
    fn from_values(options: &DynamicValues) -> OutboxResult<Self> {
        Ok(Self {
            topic_name: options.require_str(TOPIC_NAME_OPTION)?.to_string(),
            ordering_key: options.opt_str(ORDERING_KEY_OPTION)?.map(str::to_string),
        })
    }
}
