//! AMQP event stream adapter.
//!
//! Declares the target exchange (idempotently) before every publish, then
//! publishes the payload with the message headers as an AMQP field table.
//! A fresh channel is opened per send and closed when it drops.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ExchangeKind};
use outbox_core::{DynamicValue, DynamicValues, EventStream, OutboxError, OutboxMessage, OutboxResult};
use tracing::debug;

/// The exchange name option.
pub const EXCHANGE_NAME_OPTION: &str = "exchange.name";

/// The exchange type option (default `topic`).
pub const EXCHANGE_TYPE_OPTION: &str = "exchange.type";

/// The exchange durable option (default true).
pub const EXCHANGE_DURABLE_OPTION: &str = "exchange.durable";

/// The exchange auto-delete option.
pub const EXCHANGE_AUTO_DELETE_OPTION: &str = "exchange.auto_delete";

/// The exchange internal option.
pub const EXCHANGE_INTERNAL_OPTION: &str = "exchange.internal";

/// The exchange no-wait option.
pub const EXCHANGE_NO_WAIT_OPTION: &str = "exchange.no_wait";

/// The routing key option.
pub const ROUTING_KEY_OPTION: &str = "routing_key";

const DEFAULT_EXCHANGE_TYPE: &str = "topic";

/// AMQP implementation of the event stream.
pub struct AmqpEventStream {
    conn: Connection,
}

impl AmqpEventStream {
    /// Create an adapter over an established connection.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EventStream for AmqpEventStream {
    async fn send(&self, msg: &OutboxMessage) -> OutboxResult<()> {
        let opts = ExchangeOptions::from_values(&msg.options)?;

        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(OutboxError::publish)?;

        channel
            .exchange_declare(
                &opts.exchange,
                opts.kind(),
                ExchangeDeclareOptions {
                    durable: opts.durable,
                    auto_delete: opts.auto_delete,
                    internal: opts.internal,
                    nowait: opts.no_wait,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(OutboxError::publish)?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("text/plain"))
            .with_headers(headers_table(&msg.headers));

        channel
            .basic_publish(
                &opts.exchange,
                &opts.routing_key,
                BasicPublishOptions::default(),
                &msg.payload,
                properties,
            )
            .await
            .map_err(OutboxError::publish)?
            .await
            .map_err(OutboxError::publish)?;

        debug!(
            message_id = msg.id,
            exchange = %opts.exchange,
            routing_key = %opts.routing_key,
            "message published"
        );

        Ok(())
    }
}

/// Exchange settings extracted from the message options.
#[derive(Debug, PartialEq)]
struct ExchangeOptions {
    exchange: String,
    exchange_type: String,
    routing_key: String,
    durable: bool,
    auto_delete: bool,
    internal: bool,
    no_wait: bool,
}

impl ExchangeOptions {
    fn from_values(options: &DynamicValues) -> OutboxResult<Self> {
        Ok(Self {
            exchange: options.require_str(EXCHANGE_NAME_OPTION)?.to_string(),
            exchange_type: options
                .opt_str(EXCHANGE_TYPE_OPTION)?
                .unwrap_or(DEFAULT_EXCHANGE_TYPE)
                .to_string(),
            routing_key: options.require_str(ROUTING_KEY_OPTION)?.to_string(),
            durable: options.opt_bool(EXCHANGE_DURABLE_OPTION)?.unwrap_or(true),
            auto_delete: options
                .opt_bool(EXCHANGE_AUTO_DELETE_OPTION)?
                .unwrap_or(false),
            internal: options.opt_bool(EXCHANGE_INTERNAL_OPTION)?.unwrap_or(false),
            no_wait: options.opt_bool(EXCHANGE_NO_WAIT_OPTION)?.unwrap_or(false),
        })
    }

    fn kind(&self) -> ExchangeKind {
        match self.exchange_type.as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            "topic" => ExchangeKind::Topic,
            custom => ExchangeKind::Custom(custom.to_string()),
        }
    }
}

fn headers_table(headers: &DynamicValues) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        let value = match value {
            DynamicValue::Null => AMQPValue::Void,
            DynamicValue::Bool(b) => AMQPValue::Boolean(*b),
            DynamicValue::Int(i) => AMQPValue::LongLongInt(*i),
            DynamicValue::Float(f) => AMQPValue::Double(*f),
            DynamicValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
            DynamicValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}
