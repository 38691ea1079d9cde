use serde::{Deserialize, Serialize};

/// External representation of a claimed message, returned by `get`.
///
/// The internal `_id` is stringified into `id`; the payload round-trips
/// through the store's JSON column unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message<P> {
    /// Primary key of the underlying row, stringified.
    pub id: String,
    /// Token required to `ping` or `ack` this lease.
    pub ack: String,
    /// Opaque user payload.
    pub payload: P,
    /// Number of times this message has been claimed, including this claim.
    pub tries: i64,
}

/// Envelope written to a dead queue when a message exceeds its retry
/// budget. Carries the entire external representation of the over-retried
/// message, including its original id, ack, and tries, per `spec.md` §4.4.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter<P> {
    /// Id of the message in its original queue.
    pub id: String,
    /// Ack token the message was claimed under when it was dead-lettered.
    pub ack: String,
    /// Attempt count at the time of dead-lettering.
    pub tries: i64,
    /// The original payload, untouched.
    pub payload: P,
}
