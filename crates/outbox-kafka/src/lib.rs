//! Kafka event stream adapter.
//!
//! Publishes through an rdkafka `FutureProducer` and awaits every
//! delivery report, so a send only succeeds once the broker acknowledged
//! the record. The constructor refuses producer configurations that can
//! silently lose messages: `acks` must cover all replicas.

use async_trait::async_trait;
use outbox_core::{EventStream, OutboxError, OutboxMessage, OutboxResult};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::debug;

/// The topic option.
pub const TOPIC_OPTION: &str = "topic";

/// The partition option. When absent, the message id becomes the record
/// key and the partitioner picks the partition.
pub const PARTITION_OPTION: &str = "partition";

/// Kafka implementation of the event stream.
pub struct KafkaEventStream {
    producer: FutureProducer,
}

impl KafkaEventStream {
    /// Build a producer from the given config.
    ///
    /// Fails with [`OutboxError::InvalidProducerConfig`] unless `acks` is
    /// `all` (or `-1`): anything weaker can drop a record the engine has
    /// already marked dispatched.
    pub fn new(config: &ClientConfig) -> OutboxResult<Self> {
        check_producer_config(config)?;

        let producer = config
            .create::<FutureProducer>()
            .map_err(OutboxError::publish)?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl EventStream for KafkaEventStream {
    async fn send(&self, msg: &OutboxMessage) -> OutboxResult<()> {
        let plan = RecordPlan::from_message(msg)?;

        let fallback_key;
        let mut record = FutureRecord::<String, Vec<u8>>::to(&plan.topic)
            .payload(&msg.payload)
            .headers(plan.headers);

        match plan.routing {
            Routing::Partition(partition) => record = record.partition(partition),
            Routing::Key(key) => {
                fallback_key = key;
                record = record.key(&fallback_key);
            }
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::Never)
            .await
            .map_err(|(err, _)| OutboxError::publish(err))?;

        debug!(
            message_id = msg.id,
            topic = %plan.topic,
            partition,
            offset,
            "message published"
        );

        Ok(())
    }
}

enum Routing {
    Partition(i32),
    Key(String),
}

struct RecordPlan {
    topic: String,
    routing: Routing,
    headers: OwnedHeaders,
}

impl RecordPlan {
    fn from_message(msg: &OutboxMessage) -> OutboxResult<Self> {
        let topic = msg.options.require_str(TOPIC_OPTION)?;
        if topic.is_empty() {
            return Err(OutboxError::OptionType {
                key: TOPIC_OPTION,
                expected: "non-empty string",
                found: "empty string",
            });
        }

        let routing = match msg.options.opt_i64(PARTITION_OPTION)? {
            Some(partition) => {
                Routing::Partition(i32::try_from(partition).map_err(|_| {
                    OutboxError::OptionType {
                        key: PARTITION_OPTION,
                        expected: "32-bit int",
                        found: "int",
                    }
                })?)
            }
            None => Routing::Key(msg.id.to_string()),
        };

        let mut headers = OwnedHeaders::new();
        for (key, value) in msg.headers.iter() {
            let bytes = value.as_bytes().ok_or(OutboxError::OptionType {
                key: "headers",
                expected: "string or bytes",
                found: value.type_name(),
            })?;
            headers = headers.insert(Header {
                key,
                value: Some(bytes),
            });
        }

        Ok(Self {
            topic: topic.to_string(),
            routing,
            headers,
        })
    }
}

fn check_producer_config(config: &ClientConfig) -> OutboxResult<()> {
    match config.get("acks") {
        Some("all") | Some("-1") => Ok(()),
        other => Err(OutboxError::InvalidProducerConfig(format!(
            "acks must be all, got {}",
            other.unwrap_or("unset")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_topic(topic: &str) -> OutboxMessage {
        OutboxMessage::new(b"payload".to_vec()).with_option(TOPIC_OPTION, topic)
    }

    #[test]
    fn the_topic_option_is_mandatory() {
        let msg = OutboxMessage::new(b"payload".to_vec());
        let err = RecordPlan::from_message(&msg).unwrap_err();

        assert!(matches!(err, OutboxError::OptionMandatory(TOPIC_OPTION)));
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn an_empty_topic_is_rejected() {
        let err = RecordPlan::from_message(&message_with_topic("")).unwrap_err();
        assert!(matches!(
            err,
            OutboxError::OptionType {
                key: TOPIC_OPTION,
                ..
            }
        ));
    }

    #[test]
    fn a_non_string_topic_is_a_type_error() {
        let msg = OutboxMessage::new(b"payload".to_vec()).with_option(TOPIC_OPTION, 7i64);
        let err = RecordPlan::from_message(&msg).unwrap_err();
        assert!(matches!(
            err,
            OutboxError::OptionType {
                key: TOPIC_OPTION,
                ..
            }
        ));
    }

    #[test]
    fn an_explicit_partition_overrides_keying() {
        let msg = message_with_topic("orders").with_option(PARTITION_OPTION, 3i64);
        let plan = RecordPlan::from_message(&msg).unwrap();
        assert!(matches!(plan.routing, Routing::Partition(3)));
    }

    #[test]
    fn a_float_partition_from_json_decoding_is_accepted() {
        let msg = message_with_topic("orders").with_option(PARTITION_OPTION, 4.0f64);
        let plan = RecordPlan::from_message(&msg).unwrap();
        assert!(matches!(plan.routing, Routing::Partition(4)));
    }

    #[test]
    fn without_a_partition_the_message_id_becomes_the_key() {
        let mut msg = message_with_topic("orders");
        msg.id = 42;

        let plan = RecordPlan::from_message(&msg).unwrap();
        match plan.routing {
            Routing::Key(key) => assert_eq!(key, "42"),
            Routing::Partition(_) => panic!("expected key routing"),
        }
    }

    #[test]
    fn non_scalar_headers_are_rejected() {
        let msg = message_with_topic("orders").with_header("flag", true);
        let err = RecordPlan::from_message(&msg).unwrap_err();
        assert!(matches!(
            err,
            OutboxError::OptionType { key: "headers", .. }
        ));
    }

    #[test]
    fn producers_must_wait_for_all_acks() {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", "localhost:9092");
        config.set("acks", "1");

        let err = KafkaEventStream::new(&config).unwrap_err();
        assert!(matches!(err, OutboxError::InvalidProducerConfig(_)));
    }

    #[test]
    fn an_unset_acks_setting_is_rejected_too() {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", "localhost:9092");

        let err = KafkaEventStream::new(&config).unwrap_err();
        assert!(matches!(err, OutboxError::InvalidProducerConfig(_)));
    }

    #[test]
    fn acks_all_passes_the_gate() {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", "localhost:9092");
        config.set("acks", "all");

        assert!(check_producer_config(&config).is_ok());
    }
}
