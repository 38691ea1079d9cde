//! A durable, multi-consumer work queue layered on Postgres.
//!
//! Producers enqueue payloads with [`Queue::add`]; workers claim them with
//! [`Queue::get`], which hands out a time-limited lease (the *visibility
//! timeout*) and a fresh ack token. A worker extends its lease with
//! [`Queue::ping`] or finalizes the message with [`Queue::ack`]; a lease
//! that is never acked expires and the message becomes re-claimable by
//! anyone. Messages that exceed a configured retry budget are either
//! dropped or re-enqueued onto a *dead queue* for out-of-band handling.
//!
//! This is a library, not a service: a process may hold many [`Queue`]
//! handles bound to different tables on the same [`sqlx::PgPool`], and
//! cloning a handle is cheap. All coordination between concurrent producers
//! and consumers is delegated to Postgres — this crate holds no locks and
//! no in-process cache. See `SPEC_FULL.md` for the full design rationale,
//! including why Postgres stands in for the MongoDB-flavored document store
//! the originating specification was written against.
//!
//! # Non-goals
//!
//! Exactly-once delivery, strict FIFO under contention, fan-out/pub-sub,
//! priorities, cross-queue transactions, and in-process fallback queueing
//! when Postgres is unreachable are all out of scope.

mod config;
mod error;
mod identifier;
mod message;
mod queue;
mod token;

pub use config::{AddOptions, GetOptions, MaxRetries, PingOptions, QueueOptions};
pub use error::{QueueError, Result};
pub use message::{DeadLetter, Message};
pub use queue::Queue;
