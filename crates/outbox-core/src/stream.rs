//! The publish contract the engine consumes.

use crate::{OutboxMessage, OutboxResult};
use async_trait::async_trait;

/// A destination for outbox messages: a broker, queue, or topic.
///
/// Adapters interpret `msg.options` according to their own key constants
/// and ignore keys they do not recognize. No retry happens at this layer;
/// the engine retries a failed message by leaving it undispatched.
///
/// The reference engine publishes sequentially from a single dispatcher
/// loop, so implementations are never asked to handle concurrent sends
/// for the same engine instance.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Publish one message.
    async fn send(&self, msg: &OutboxMessage) -> OutboxResult<()>;
}
