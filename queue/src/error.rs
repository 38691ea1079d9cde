use thiserror::Error;

/// Errors surfaced by [`crate::Queue`] operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Raised synchronously at construction time: a missing/empty collection
    /// name, an unsafe identifier, or an empty batch passed to `add`.
    #[error("queue configuration error: {0}")]
    Configuration(String),

    /// Any failure reported by Postgres, surfaced unchanged. The library
    /// performs no retry of its own.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// `ping` or `ack` against a token that does not match a live lease:
    /// unknown, expired, or already acked. Carries the offending token.
    #[error("unidentified ack: {0}")]
    StaleAck(String),

    /// A payload failed to (de)serialize to/from the store's JSON column.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, QueueError>;
