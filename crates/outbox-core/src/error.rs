//! Error types shared by the engine, stores, and stream adapters.

use thiserror::Error;

/// Source type for backend failures.
///
/// Stores and adapters wrap their driver errors in this so that any
/// implementation plugs into the same taxonomy.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// No data store was configured
    #[error("a data store is required for the outboxer to work")]
    MissingDataStore,

    /// No event stream was configured
    #[error("an event stream is required for the outboxer to work")]
    MissingEventStream,

    /// The dispatcher poll period was left at zero
    #[error("a non-zero check interval is required to start the dispatcher")]
    MissingCheckInterval,

    /// `start` was called while the background loops were already running
    #[error("the outboxer is already running")]
    AlreadyRunning,

    /// The store connection resolves to no database name
    #[error("no database name")]
    NoDatabaseName,

    /// The store connection resolves to no schema
    #[error("no schema")]
    NoSchema,

    /// The bootstrap advisory lock could not be acquired, or is already held
    #[error("can't acquire lock")]
    Locked,

    /// The producer client was configured in a way that can lose messages
    #[error("invalid producer config: {0}")]
    InvalidProducerConfig(String),

    /// A data store operation failed
    #[error("data store error: {0}")]
    Storage(#[source] BoxedSource),

    /// The event stream rejected or failed a publish
    #[error("publish failed: {0}")]
    Publish(#[source] BoxedSource),

    /// Stored dynamic values could not be decoded
    #[error("failed to decode dynamic values: {0}")]
    Decode(#[from] serde_json::Error),

    /// A mandatory message option is missing
    #[error("option {0} is mandatory")]
    OptionMandatory(&'static str),

    /// A message option carries a value of the wrong type
    #[error("wrong type for option {key}: expected {expected}, got {found}")]
    OptionType {
        key: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    /// The operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,
}

impl OutboxError {
    /// Wrap a driver error as a data store failure.
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        OutboxError::Storage(Box::new(err))
    }

    /// Wrap a client error as a publish failure.
    pub fn publish<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        OutboxError::Publish(Box::new(err))
    }
}

/// Result type alias using [`OutboxError`].
pub type OutboxResult<T> = Result<T, OutboxError>;
