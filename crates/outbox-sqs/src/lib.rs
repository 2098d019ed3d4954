//! AWS SQS event stream adapter.
//!
//! Sends one message per outbox row. SQS bodies are text, so the payload
//! is forwarded as UTF-8 (lossily for non-UTF-8 bytes); headers become
//! String-typed message attributes.

use async_trait::async_trait;
use aws_sdk_sqs::types::MessageAttributeValue;
use aws_sdk_sqs::Client;
use outbox_core::{DynamicValues, EventStream, OutboxError, OutboxMessage, OutboxResult};
use std::collections::HashMap;
use tracing::debug;

/// The queue URL option.
pub const QUEUE_NAME_OPTION: &str = "queue_name";

/// The delivery delay option, in seconds.
pub const DELAY_SECONDS_OPTION: &str = "delay_seconds";

/// The message group id option (FIFO queues).
pub const MESSAGE_GROUP_ID_OPTION: &str = "message_group_id";

/// The deduplication id option (FIFO queues).
pub const MESSAGE_DEDUP_ID_OPTION: &str = "message_dedup_id";

/// SQS implementation of the event stream.
pub struct SqsEventStream {
    client: Client,
}

impl SqsEventStream {
    /// Create an adapter over a configured SQS client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventStream for SqsEventStream {
    async fn send(&self, msg: &OutboxMessage) -> OutboxResult<()> {
        let plan = SendPlan::from_values(&msg.options)?;
        let attributes = message_attributes(&msg.headers)?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&plan.queue_url)
            .message_body(String::from_utf8_lossy(&msg.payload).into_owned());

        if let Some(delay) = plan.delay_seconds {
            request = request.delay_seconds(delay);
        }
        if let Some(group) = &plan.message_group_id {
            request = request.message_group_id(group);
        }
        if let Some(dedup) = &plan.message_dedup_id {
            request = request.message_deduplication_id(dedup);
        }
        for (key, value) in attributes {
            request = request.message_attributes(key, value);
        }

        request.send().await.map_err(OutboxError::publish)?;

        debug!(message_id = msg.id, queue_url = %plan.queue_url, "message published");
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
struct SendPlan {
    queue_url: String,
    delay_seconds: Option<i32>,
    message_group_id: Option<String>,
    message_dedup_id: Option<String>,
}

impl SendPlan {
    fn from_values(options: &DynamicValues) -> OutboxResult<Self> {
        let delay_seconds = match options.opt_i64(DELAY_SECONDS_OPTION)? {
            None => None,
            Some(delay) => {
                Some(
                    i32::try_from(delay).map_err(|_| OutboxError::OptionType {
                        key: DELAY_SECONDS_OPTION,
                        expected: "32-bit int",
                        found: "int",
                    })?,
                )
            }
        };

        Ok(Self {
            queue_url: options.require_str(QUEUE_NAME_OPTION)?.to_string(),
            delay_seconds,
            message_group_id: options
                .opt_str(MESSAGE_GROUP_ID_OPTION)?
                .map(str::to_string),
            message_dedup_id: options
                .opt_str(MESSAGE_DEDUP_ID_OPTION)?
                .map(str::to_string),
        })
    }
}

fn message_attributes(
    headers: &DynamicValues,
) -> OutboxResult<HashMap<String, MessageAttributeValue>> {
    let mut attributes = HashMap::new();

    for (key, value) in headers.iter() {
        let text = value.as_str().ok_or(OutboxError::OptionType {
            key: "headers",
            expected: "string",
            found: value.type_name(),
        })?;

        let attribute = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(text)
            .build()
            .map_err(OutboxError::publish)?;

        attributes.insert(key.clone(), attribute);
    }

    Ok(attributes)
}
