use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::config::{AddOptions, GetOptions, PingOptions, QueueOptions};
use crate::error::{QueueError, Result};
use crate::identifier::validate_identifier;
use crate::message::{DeadLetter, Message};
use crate::token::new_ack_token;

/// A durable, multi-consumer work queue bound to one Postgres table.
///
/// Cloning a `Queue` is cheap — it shares the underlying connection pool —
/// so handles can be held by many tasks or processes concurrently. All
/// mutual exclusion is delegated to Postgres (`FOR UPDATE SKIP LOCKED`,
/// `RETURNING`, partial unique indexes); the queue itself holds no
/// in-process state beyond its immutable configuration.
pub struct Queue<P> {
    pool: PgPool,
    table: String,
    opts: QueueOptions,
    _payload: PhantomData<fn() -> P>,
}

// Written by hand rather than `#[derive(Clone)]`: a derive would require
// `P: Clone`, even though `P` only ever appears behind a zero-sized
// `PhantomData` marker and no `P` value is ever cloned.
impl<P> Clone for Queue<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            table: self.table.clone(),
            opts: self.opts.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for Queue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("table", &self.table)
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl<P> Queue<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Bind a `Queue` handle to `name` on `pool`.
    ///
    /// Fails synchronously (not via the async result) if `name` is empty or
    /// is not a safe SQL identifier — this is a configuration error, not a
    /// store error, matching `spec.md` §6's "none throw synchronously except
    /// the constructor".
    pub fn new(pool: PgPool, name: impl Into<String>, opts: QueueOptions) -> Result<Self> {
        let table = name.into();
        validate_identifier(&table)?;
        Ok(Self {
            pool,
            table,
            opts,
            _payload: PhantomData,
        })
    }

    fn quoted_table(&self) -> String {
        format!("\"{}\"", self.table)
    }

    /// Create the backing table and its indexes if they do not already
    /// exist. Idempotent. Returns the name of the claim-query index.
    pub async fn ensure_schema(&self) -> Result<String> {
        let table = self.quoted_table();
        let claim_idx = format!("{}_claim_idx", self.table);
        let ack_idx = format!("{}_ack_idx", self.table);
        let debounce_idx = format!("{}_debounce_idx", self.table);

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                payload JSONB NOT NULL,
                visible TIMESTAMPTZ NOT NULL,
                ack TEXT,
                tries BIGINT NOT NULL DEFAULT 0,
                deleted TIMESTAMPTZ,
                debounce TEXT,
                legacy_visible_text TEXT,
                legacy_deleted_text TEXT
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        // Claim-query index: every `get` and `size` scans this.
        sqlx::query(&format!(
            r#"CREATE INDEX IF NOT EXISTS "{claim_idx}" ON {table} (visible) WHERE deleted IS NULL"#
        ))
        .execute(&self.pool)
        .await?;

        // Unique-sparse: two live leases never share an ack token.
        sqlx::query(&format!(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS "{ack_idx}" ON {table} (ack) WHERE ack IS NOT NULL"#
        ))
        .execute(&self.pool)
        .await?;

        // Unique-sparse: at most one pending-or-delayed row per debounce key.
        sqlx::query(&format!(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS "{debounce_idx}" ON {table} (debounce) WHERE ack IS NULL AND deleted IS NULL"#
        ))
        .execute(&self.pool)
        .await?;

        debug!(table = %self.table, "queue schema ensured");
        Ok(claim_idx)
    }

    /// One-shot upgrade of legacy string-stored timestamps to native
    /// `TIMESTAMPTZ` values, via a single bulk `UPDATE`. Returns the number
    /// of rows modified; a no-op leaves the table untouched.
    pub async fn migrate(&self) -> Result<u64> {
        let table = self.quoted_table();
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET
                visible = CASE WHEN legacy_visible_text IS NOT NULL
                               THEN legacy_visible_text::timestamptz
                               ELSE visible END,
                deleted = CASE WHEN legacy_deleted_text IS NOT NULL
                               THEN legacy_deleted_text::timestamptz
                               ELSE deleted END,
                legacy_visible_text = NULL,
                legacy_deleted_text = NULL
            WHERE legacy_visible_text IS NOT NULL OR legacy_deleted_text IS NOT NULL
            "#
        ))
        .execute(&self.pool)
        .await?;

        let modified = result.rows_affected();
        if modified > 0 {
            info!(table = %self.table, modified, "migrated legacy timestamp rows");
        }
        Ok(modified)
    }

    /// Enqueue a single payload. See [`Queue::add_batch`] for the batch form
    /// and `spec.md` §4.3 for debounce semantics.
    pub async fn add(&self, payload: P, opts: AddOptions) -> Result<String> {
        let mut ids = self.add_batch(vec![payload], opts).await?;
        Ok(ids.remove(0))
    }

    /// Enqueue a non-empty batch of payloads inside a single transaction.
    ///
    /// Without a debounce key this is one multi-row `INSERT`. With a
    /// debounce key, each element is applied as its own atomic
    /// insert-or-push-forward upsert (still inside one transaction), because
    /// every element may independently match or miss the same coalescing
    /// target depending on what else has committed concurrently.
    pub async fn add_batch(&self, payloads: Vec<P>, opts: AddOptions) -> Result<Vec<String>> {
        if payloads.is_empty() {
            return Err(QueueError::Configuration(
                "add() batch must not be empty".into(),
            ));
        }

        let delay = opts.delay.unwrap_or(self.opts.delay);
        let table = self.quoted_table();
        let mut tx = self.pool.begin().await?;

        let ids = if let Some(debounce) = opts.debounce.as_deref() {
            let mut out = Vec::with_capacity(payloads.len());
            for payload in payloads {
                let payload_json = serde_json::to_value(&payload)?;
                let row: (i64, bool) = sqlx::query_as(&format!(
                    r#"
                    INSERT INTO {table} (payload, visible, debounce)
                    VALUES ($1, NOW() + ($2::float8 * interval '1 second'), $3)
                    ON CONFLICT (debounce) WHERE ack IS NULL AND deleted IS NULL
                    DO UPDATE SET visible = EXCLUDED.visible, payload = EXCLUDED.payload
                    RETURNING id, (xmax = 0) AS inserted
                    "#
                ))
                .bind(payload_json)
                .bind(delay.as_secs_f64())
                .bind(debounce)
                .fetch_one(&mut *tx)
                .await?;

                let (id, inserted) = row;
                out.push(if inserted {
                    id.to_string()
                } else {
                    "(debounced)".to_string()
                });
            }
            out
        } else {
            let payload_jsons = payloads
                .iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let delay_secs = delay.as_secs_f64();

            // One multi-row INSERT, built with one `($n, NOW() + ...)` tuple
            // per payload so the whole batch commits as a single statement.
            // The delay is shared by every row, bound once as the final
            // parameter.
            let delay_param = payload_jsons.len() + 1;
            let tuples = (1..=payload_jsons.len())
                .map(|i| format!("(${i}, NOW() + (${delay_param}::float8 * interval '1 second'))"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql =
                format!("INSERT INTO {table} (payload, visible) VALUES {tuples} RETURNING id");

            let mut query = sqlx::query_as::<_, (i64,)>(&sql);
            for payload_json in payload_jsons {
                query = query.bind(payload_json);
            }
            query = query.bind(delay_secs);
            let rows = query.fetch_all(&mut *tx).await?;

            rows.into_iter().map(|(id,)| id.to_string()).collect()
        };

        tx.commit().await?;
        debug!(table = %self.table, count = ids.len(), "enqueued batch");
        Ok(ids)
    }

    /// Atomically claim the oldest visible, undeleted message.
    ///
    /// Implemented as an explicit loop rather than recursion (`spec.md` §9
    /// flags recursion as the natural translation of the original
    /// callback-threaded source, but Rust `async fn` recursion requires
    /// heap-boxing the future, so a loop is both simpler and cheaper here).
    /// A message whose `tries` exceeds the configured retry budget is
    /// dead-lettered (or discarded) and the loop continues, so the caller
    /// never observes an over-retried message.
    ///
    /// Note: `tries` is incremented on every claim, including claims that
    /// are immediately dead-lettered — a message whose lease keeps expiring
    /// without any consumer ever failing it will still eventually hit
    /// `max_retries`. This is the documented, preserved behavior from
    /// `spec.md` §9, not a bug to silently fix.
    pub async fn get(&self, opts: GetOptions) -> Result<Option<Message<P>>> {
        loop {
            let Some(msg) = self.claim_one(&opts).await? else {
                return Ok(None);
            };

            if self.opts.max_retries.exceeded(msg.tries) {
                self.dead_letter(msg).await?;
                continue;
            }

            return Ok(Some(msg));
        }
    }

    async fn claim_one(&self, opts: &GetOptions) -> Result<Option<Message<P>>> {
        let table = self.quoted_table();
        let visibility = opts.visibility.unwrap_or(self.opts.visibility);
        let ack = new_ack_token();

        let row: Option<(i64, serde_json::Value, i64)> = sqlx::query_as(&format!(
            r#"
            UPDATE {table}
            SET tries = tries + 1,
                ack = $1,
                visible = NOW() + ($2::float8 * interval '1 second')
            WHERE id = (
                SELECT id FROM {table}
                WHERE deleted IS NULL AND visible <= NOW()
                ORDER BY id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, tries
            "#
        ))
        .bind(&ack)
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, payload_json, tries)) = row else {
            return Ok(None);
        };

        let payload: P = serde_json::from_value(payload_json)?;
        debug!(table = %self.table, id, tries, "claimed message");
        Ok(Some(Message {
            id: id.to_string(),
            ack,
            payload,
            tries,
        }))
    }

    async fn dead_letter(&self, msg: Message<P>) -> Result<()> {
        let Some(dead_queue) = self.opts.dead_queue.clone() else {
            warn!(
                table = %self.table,
                id = %msg.id,
                tries = msg.tries,
                "message exceeded max_retries with no dead queue configured; discarding"
            );
            self.ack(&msg.ack).await?;
            return Ok(());
        };

        let envelope = DeadLetter {
            id: msg.id.clone(),
            ack: msg.ack.clone(),
            tries: msg.tries,
            payload: serde_json::to_value(&msg.payload)?,
        };
        let envelope_value = serde_json::to_value(&envelope)?;

        warn!(
            table = %self.table,
            id = %msg.id,
            tries = msg.tries,
            "dead-lettering message"
        );
        dead_queue.add(envelope_value, AddOptions::default()).await?;
        self.ack(&msg.ack).await?;
        Ok(())
    }

    /// Extend the lease on a claimed message. Fails with
    /// [`QueueError::StaleAck`] if the token does not match a live lease
    /// (unknown, expired, or already acked).
    pub async fn ping(&self, ack: &str, opts: PingOptions) -> Result<String> {
        let table = self.quoted_table();
        let visibility = opts.visibility.unwrap_or(self.opts.visibility);

        let row: Option<(i64,)> = sqlx::query_as(&format!(
            r#"
            UPDATE {table}
            SET visible = NOW() + ($2::float8 * interval '1 second')
            WHERE ack = $1 AND visible > NOW() AND deleted IS NULL
            RETURNING id
            "#
        ))
        .bind(ack)
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((id,)) => Ok(id.to_string()),
            None => Err(QueueError::StaleAck(ack.to_string())),
        }
    }

    /// Finalize a message: marks it terminally deleted. Acking an expired
    /// lease is rejected with [`QueueError::StaleAck`] — the caller must
    /// re-`get` instead.
    pub async fn ack(&self, ack: &str) -> Result<String> {
        let table = self.quoted_table();

        let row: Option<(i64,)> = sqlx::query_as(&format!(
            r#"
            UPDATE {table}
            SET deleted = NOW()
            WHERE ack = $1 AND visible > NOW() AND deleted IS NULL
            RETURNING id
            "#
        ))
        .bind(ack)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((id,)) => Ok(id.to_string()),
            None => Err(QueueError::StaleAck(ack.to_string())),
        }
    }

    /// Delete every message with `deleted` set. Best-effort; with Postgres
    /// there is no native TTL index to make this unnecessary (see
    /// `SPEC_FULL.md` §0), so this remains the sole reclamation mechanism.
    ///
    /// If `clean_after` was configured, only rows deleted at least that long
    /// ago are removed; otherwise every deleted row is removed.
    pub async fn clean(&self) -> Result<u64> {
        let table = self.quoted_table();
        let result = match self.opts.clean_after {
            Some(after) => {
                sqlx::query(&format!(
                    r#"
                    DELETE FROM {table}
                    WHERE deleted IS NOT NULL
                      AND deleted <= NOW() - ($1::float8 * interval '1 second')
                    "#
                ))
                .bind(after.as_secs_f64())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(r#"DELETE FROM {table} WHERE deleted IS NOT NULL"#))
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Count all messages, regardless of state.
    pub async fn total(&self) -> Result<u64> {
        self.count("TRUE").await
    }

    /// Count messages currently claimable (the claim-query filter).
    pub async fn size(&self) -> Result<u64> {
        self.count("deleted IS NULL AND visible <= NOW()").await
    }

    /// Count messages with a live, unexpired lease.
    pub async fn in_flight(&self) -> Result<u64> {
        self.count("ack IS NOT NULL AND visible > NOW() AND deleted IS NULL")
            .await
    }

    /// Count terminally acked messages.
    pub async fn done(&self) -> Result<u64> {
        self.count("deleted IS NOT NULL").await
    }

    async fn count(&self, predicate: &str) -> Result<u64> {
        let table = self.quoted_table();
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {table} WHERE {predicate}"
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}
