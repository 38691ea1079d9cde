use std::sync::Arc;
use std::time::Duration;

use crate::Queue;

/// Retry budget before a message is dead-lettered (or discarded, if no dead
/// queue is configured).
///
/// Represented as an enum rather than a sentinel "infinite" numeric value so
/// "dead-lettering disabled" is a distinct, unrepresentable-by-accident
/// configuration state.
#[derive(Clone, Debug)]
pub enum MaxRetries {
    /// No retry limit; messages are redelivered on lease expiry forever.
    Disabled,
    /// Dead-letter (or drop, if no dead queue) once `tries` exceeds `limit`.
    Limit(u32),
}

impl MaxRetries {
    pub(crate) fn exceeded(&self, tries: i64) -> bool {
        match self {
            MaxRetries::Disabled => false,
            MaxRetries::Limit(limit) => tries > i64::from(*limit),
        }
    }
}

/// Construction-time configuration for a [`Queue`].
///
/// All fields carry defaults; unrecognized configuration is simply not
/// representable here rather than silently ignored.
#[derive(Clone, Debug)]
pub struct QueueOptions {
    /// Default lease duration applied by `get`/`ping` when the call site
    /// does not override it.
    pub visibility: Duration,
    /// Default initial delay applied by `add` when the call does not
    /// specify one.
    pub delay: Duration,
    /// Destination queue for messages that exceed `max_retries`.
    pub dead_queue: Option<Arc<Queue<serde_json::Value>>>,
    /// Retry budget. Defaults to `Limit(5)` when `dead_queue` is set and to
    /// `Disabled` otherwise, matching `spec.md` §4.1.
    pub max_retries: MaxRetries,
    /// If set, `deleted` rows older than this are eligible for `clean()`.
    /// Postgres has no native TTL index (see `SPEC_FULL.md` §0); this value
    /// is advisory and only takes effect when `clean()` is actually called.
    pub clean_after: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility: Duration::from_secs(30),
            delay: Duration::from_secs(0),
            dead_queue: None,
            max_retries: MaxRetries::Disabled,
            clean_after: None,
        }
    }
}

impl QueueOptions {
    /// Start from defaults, then attach a dead queue and switch the retry
    /// budget to the conventional default of 5 unless the caller overrides
    /// it afterwards.
    pub fn with_dead_queue(mut self, dead_queue: Arc<Queue<serde_json::Value>>) -> Self {
        self.dead_queue = Some(dead_queue);
        self.max_retries = MaxRetries::Limit(5);
        self
    }

    /// Override the retry budget.
    pub fn max_retries(mut self, max_retries: MaxRetries) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the default lease visibility.
    pub fn visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    /// Override the default initial delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Enable `clean()`-driven expiry of deleted rows older than `after`.
    pub fn clean_after(mut self, after: Duration) -> Self {
        self.clean_after = Some(after);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_exceeded() {
        assert!(!MaxRetries::Disabled.exceeded(0));
        assert!(!MaxRetries::Disabled.exceeded(1_000_000));
    }

    #[test]
    fn limit_exceeded_strictly_after_the_limit() {
        let limit = MaxRetries::Limit(2);
        assert!(!limit.exceeded(1));
        assert!(!limit.exceeded(2));
        assert!(limit.exceeded(3));
    }

    #[test]
    fn defaults_have_no_retry_limit() {
        let opts = QueueOptions::default();
        assert!(matches!(opts.max_retries, MaxRetries::Disabled));
        assert!(opts.dead_queue.is_none());
    }
}

/// Per-call overrides accepted by `add`.
#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    /// Overrides the queue's default delay, including an explicit zero.
    pub delay: Option<Duration>,
    /// Coalescing key. See `spec.md` §4.3.
    pub debounce: Option<String>,
}

/// Per-call overrides accepted by `get`.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Overrides the queue's default lease visibility.
    pub visibility: Option<Duration>,
}

/// Per-call overrides accepted by `ping`.
#[derive(Clone, Debug, Default)]
pub struct PingOptions {
    /// Overrides the queue's default lease visibility.
    pub visibility: Option<Duration>,
}
