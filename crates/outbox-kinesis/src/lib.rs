//! AWS Kinesis event stream adapter.
//!
//! Puts one record per outbox message. When no partition key is supplied
//! the current timestamp is used, spreading records across shards.

use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::Client;
use chrono::{SecondsFormat, Utc};
use outbox_core::{DynamicValues, EventStream, OutboxError, OutboxMessage, OutboxResult};
use tracing::debug;

/// The stream name option.
pub const STREAM_NAME_OPTION: &str = "stream_name";

/// The partition key option (default: current time, RFC 3339 with
/// nanoseconds).
pub const PARTITION_KEY_OPTION: &str = "partition_key";

/// The explicit hash key option.
pub const EXPLICIT_HASH_KEY_OPTION: &str = "explicit_hash_key";

/// The sequence-number-for-ordering option.
pub const SEQUENCE_NUMBER_FOR_ORDERING_OPTION: &str = "sequence_number_for_ordering";

/// Kinesis implementation of the event stream.
pub struct KinesisEventStream {
    client: Client,
}

impl KinesisEventStream {
    /// Create an adapter over a configured Kinesis client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventStream for KinesisEventStream {
    async fn send(&self, msg: &OutboxMessage) -> OutboxResult<()> {
        let plan = RecordPlan::from_values(&msg.options)?;

        let mut request = self
            .client
            .put_record()
            .stream_name(&plan.stream_name)
            .partition_key(&plan.partition_key)
            .data(Blob::new(msg.payload.clone()));

        if let Some(hash_key) = &plan.explicit_hash_key {
            request = request.explicit_hash_key(hash_key);
        }
        if let Some(sequence) = &plan.sequence_number_for_ordering {
            request = request.sequence_number_for_ordering(sequence);
        }

        request.send().await.map_err(OutboxError::publish)?;

        debug!(
            message_id = msg.id,
            stream_name = %plan.stream_name,
            partition_key = %plan.partition_key,
            "message published"
        );

        Ok(())
    }
}

#[derive(Debug, PartialEq)]
struct RecordPlan {
    stream_name: String,
    partition_key: String,
    explicit_hash_key: Option<String>,
    sequence_number_for_ordering: Option<String>,
}

impl RecordPlan {
    fn from_values(options: &DynamicValues) -> OutboxResult<Self> {
        let partition_key = match options.opt_str(PARTITION_KEY_OPTION)? {
            Some(key) => key.to_string(),
            None => Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        };

        Ok(Self {
            stream_name: options.require_str(STREAM_NAME_OPTION)?.to_string(),
            partition_key,
            explicit_hash_key: options
                .opt_str(EXPLICIT_HASH_KEY_OPTION)?
                .map(str::to_string),
            sequence_number_for_ordering: options
                .opt_str(SEQUENCE_NUMBER_FOR_ORDERING_OPTION)?
                .map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn base_options() -> DynamicValues {
        let mut options = DynamicValues::new();
        options.insert(STREAM_NAME_OPTION, "orders");
        options
    }

    #[test]
    fn the_stream_name_is_mandatory() {
        let err = RecordPlan::from_values(&DynamicValues::new()).unwrap_err();
        assert!(matches!(
            err,
            OutboxError::OptionMandatory(STREAM_NAME_OPTION)
        ));
    }

    #[test]
    fn the_default_partition_key_is_a_timestamp() {
        let plan = RecordPlan::from_values(&base_options()).unwrap();
        assert_eq!(plan.stream_name, "orders");

        // RFC 3339 with sub-second precision
        let parsed = DateTime::parse_from_rfc3339(&plan.partition_key);
        assert!(parsed.is_ok(), "unparseable key: {}", plan.partition_key);
    }

    #[test]
    fn explicit_options_are_extracted() {
        let mut options = base_options();
        options.insert(PARTITION_KEY_OPTION, "customer-17");
        options.insert(EXPLICIT_HASH_KEY_OPTION, "12345");
        options.insert(SEQUENCE_NUMBER_FOR_ORDERING_OPTION, "49590338271");

        let plan = RecordPlan::from_values(&options).unwrap();
        assert_eq!(plan.partition_key, "customer-17");
        assert_eq!(plan.explicit_hash_key.as_deref(), Some("12345"));
        assert_eq!(
            plan.sequence_number_for_ordering.as_deref(),
            Some("49590338271")
        );
    }

    #[test]
    fn a_non_string_partition_key_is_a_type_error() {
        let mut options = base_options();
        options.insert(PARTITION_KEY_OPTION, 5i64);

        let err = RecordPlan::from_values(&options).unwrap_err();
        assert!(matches!(
            err,
            OutboxError::OptionType {
                key: PARTITION_KEY_OPTION,
                ..
            }
        ));
    }
}
