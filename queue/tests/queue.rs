//! End-to-end scenarios against a real Postgres instance, covering the
//! lifecycle properties and scenarios from `spec.md` §8.

use std::sync::Arc;
use std::time::Duration;

use pg_queue::{AddOptions, GetOptions, MaxRetries, PingOptions, Queue, QueueOptions};
use sqlx::PgPool;

async fn setup<P>(pool: &PgPool, name: &str, opts: QueueOptions) -> Queue<P>
where
    P: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let queue = Queue::new(pool.clone(), name, opts).expect("valid queue config");
    queue.ensure_schema().await.expect("schema creation");
    queue
}

#[sqlx::test(migrations = false)]
async fn enqueue_claim_ack_roundtrip(pool: PgPool) {
    let queue: Queue<String> = setup(&pool, "roundtrip", QueueOptions::default()).await;

    queue
        .add("hello".to_string(), AddOptions::default())
        .await
        .expect("add");

    let msg = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message present");
    assert_eq!(msg.payload, "hello");
    assert_eq!(msg.tries, 1);

    queue.ack(&msg.ack).await.expect("ack");

    let after = queue.get(GetOptions::default()).await.expect("get");
    assert!(after.is_none(), "acked message must not be reclaimable");
}

#[sqlx::test(migrations = false)]
async fn add_batch_increases_total_by_batch_size(pool: PgPool) {
    let queue: Queue<String> = setup(&pool, "batch", QueueOptions::default()).await;

    let ids = queue
        .add_batch(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            AddOptions::default(),
        )
        .await
        .expect("add_batch");
    assert_eq!(ids.len(), 3);
    assert_eq!(queue.total().await.expect("total"), 3);
}

#[sqlx::test(migrations = false)]
async fn add_batch_rejects_empty_input(pool: PgPool) {
    let queue: Queue<String> = setup(&pool, "empty_batch", QueueOptions::default()).await;
    let err = queue.add_batch(vec![], AddOptions::default()).await;
    assert!(err.is_err(), "empty batch must be a configuration error");
}

#[sqlx::test(migrations = false)]
async fn delayed_message_not_visible_until_delay_elapses(pool: PgPool) {
    let opts = QueueOptions::default().delay(Duration::from_millis(300));
    let queue: Queue<String> = setup(&pool, "delayed", opts).await;

    queue
        .add("x".to_string(), AddOptions::default())
        .await
        .expect("add");

    let immediate = queue.get(GetOptions::default()).await.expect("get");
    assert!(immediate.is_none(), "delayed message must not be visible yet");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let delayed = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message should be visible after its delay elapses");
    assert_eq!(delayed.payload, "x");
}

#[sqlx::test(migrations = false)]
async fn debounce_coalesces_pending_messages(pool: PgPool) {
    let opts = QueueOptions::default().delay(Duration::from_millis(300));
    let queue: Queue<String> = setup(&pool, "debounced", opts).await;

    let first_opts = AddOptions {
        delay: None,
        debounce: Some("greetings".to_string()),
    };
    let first_id = queue
        .add("Hello, World!".to_string(), first_opts)
        .await
        .expect("first add");

    assert!(queue.get(GetOptions::default()).await.expect("get").is_none());

    let second_opts = AddOptions {
        delay: None,
        debounce: Some("greetings".to_string()),
    };
    let second_id = queue
        .add("Bonjour, monde!".to_string(), second_opts)
        .await
        .expect("second add");
    assert_eq!(second_id, "(debounced)", "coalesced add returns the sentinel id");
    assert_ne!(first_id, "(debounced)");

    assert!(queue.get(GetOptions::default()).await.expect("get").is_none());
    assert_eq!(queue.total().await.expect("total"), 1, "coalesced into one row");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let msg = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message visible after delay");
    assert_eq!(
        msg.payload, "Bonjour, monde!",
        "last writer's payload wins the coalesced row"
    );

    queue.ack(&msg.ack).await.expect("ack");
    assert!(queue.get(GetOptions::default()).await.expect("get").is_none());
}

#[sqlx::test(migrations = false)]
async fn debounce_never_coalesces_a_leased_message(pool: PgPool) {
    let queue: Queue<String> = setup(&pool, "debounce_leased", QueueOptions::default()).await;

    queue
        .add(
            "first".to_string(),
            AddOptions {
                delay: None,
                debounce: Some("k".to_string()),
            },
        )
        .await
        .expect("add");

    let claimed = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message present");

    // The pending row is now leased; a same-key add must insert a new row
    // rather than coalesce into it.
    let second_id = queue
        .add(
            "second".to_string(),
            AddOptions {
                delay: None,
                debounce: Some("k".to_string()),
            },
        )
        .await
        .expect("add");
    assert_ne!(second_id, "(debounced)");
    assert_eq!(queue.total().await.expect("total"), 2);

    queue.ack(&claimed.ack).await.expect("ack");
}

#[sqlx::test(migrations = false)]
async fn lease_expiry_redelivers_with_incremented_tries(pool: PgPool) {
    let opts = QueueOptions::default().visibility(Duration::from_millis(300));
    let queue: Queue<String> = setup(&pool, "redelivery", opts).await;

    queue
        .add("y".to_string(), AddOptions::default())
        .await
        .expect("add");

    let first = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message present");
    assert_eq!(first.tries, 1);

    tokio::time::sleep(Duration::from_millis(500)).await;

    let second = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("expired lease must be reclaimable");
    assert_eq!(second.id, first.id);
    assert_eq!(second.tries, 2, "tries increments on every claim");
}

#[sqlx::test(migrations = false)]
async fn ping_extends_lease_past_original_deadline(pool: PgPool) {
    let opts = QueueOptions::default().visibility(Duration::from_secs(2));
    let queue: Queue<String> = setup(&pool, "pinged", opts).await;

    queue
        .add("z".to_string(), AddOptions::default())
        .await
        .expect("add");

    let msg = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message present");

    tokio::time::sleep(Duration::from_secs(1)).await;
    queue
        .ping(&msg.ack, PingOptions::default())
        .await
        .expect("ping should extend the still-live lease");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    queue
        .ack(&msg.ack)
        .await
        .expect("ack should succeed within the extended lease");
}

#[sqlx::test(migrations = false)]
async fn stale_ack_is_rejected_after_lease_expiry(pool: PgPool) {
    let opts = QueueOptions::default().visibility(Duration::from_millis(300));
    let queue: Queue<String> = setup(&pool, "stale_ack", opts).await;

    queue
        .add("w".to_string(), AddOptions::default())
        .await
        .expect("add");
    let msg = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message present");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let result = queue.ack(&msg.ack).await;
    assert!(
        matches!(result, Err(pg_queue::QueueError::StaleAck(ref t)) if t == &msg.ack),
        "ack against an expired lease must fail with StaleAck"
    );
}

#[sqlx::test(migrations = false)]
async fn dead_letters_after_max_retries(pool: PgPool) {
    let dead: Queue<serde_json::Value> =
        setup(&pool, "dead_letters", QueueOptions::default()).await;
    let dead = Arc::new(dead);

    let source_opts = QueueOptions::default()
        .visibility(Duration::from_millis(200))
        .with_dead_queue(dead.clone())
        .max_retries(MaxRetries::Limit(2));
    let source: Queue<String> = setup(&pool, "source", source_opts).await;

    source
        .add("payload-m".to_string(), AddOptions::default())
        .await
        .expect("add");

    // Two expired leases: tries goes 1, then 2 (both within the budget).
    let first = source
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message present");
    assert_eq!(first.tries, 1);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = source
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message re-claimable after lease expiry");
    assert_eq!(second.tries, 2);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The third claim pushes tries to 3, exceeds the limit of 2, and is
    // dead-lettered internally; the caller never sees it.
    let third = source.get(GetOptions::default()).await.expect("get");
    assert!(
        third.is_none(),
        "over-retried message must not be returned to the source queue's caller"
    );

    let on_dead_queue = dead
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("dead-lettered envelope present");
    assert_eq!(on_dead_queue.payload["payload"], "payload-m");
    assert_eq!(on_dead_queue.payload["tries"], 3);
}

#[sqlx::test(migrations = false)]
async fn counts_partition_total_without_overlap(pool: PgPool) {
    let queue: Queue<String> = setup(&pool, "counts", QueueOptions::default()).await;

    queue
        .add_batch(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            AddOptions::default(),
        )
        .await
        .expect("add_batch");

    let claimed = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message present");

    assert_eq!(queue.total().await.expect("total"), 3);
    assert_eq!(queue.size().await.expect("size"), 2);
    assert_eq!(queue.in_flight().await.expect("in_flight"), 1);
    assert_eq!(queue.done().await.expect("done"), 0);

    queue.ack(&claimed.ack).await.expect("ack");

    assert_eq!(queue.size().await.expect("size"), 2);
    assert_eq!(queue.in_flight().await.expect("in_flight"), 0);
    assert_eq!(queue.done().await.expect("done"), 1);

    let removed = queue.clean().await.expect("clean");
    assert_eq!(removed, 1);
    assert_eq!(queue.total().await.expect("total"), 2);
}

#[sqlx::test(migrations = false)]
async fn clean_after_honors_grace_period(pool: PgPool) {
    let opts = QueueOptions::default().clean_after(Duration::from_millis(500));
    let queue: Queue<String> = setup(&pool, "clean_after", opts).await;

    queue
        .add("done-soon".to_string(), AddOptions::default())
        .await
        .expect("add");
    let msg = queue
        .get(GetOptions::default())
        .await
        .expect("get")
        .expect("message present");
    queue.ack(&msg.ack).await.expect("ack");

    let removed_early = queue.clean().await.expect("clean");
    assert_eq!(removed_early, 0, "grace period has not elapsed yet");

    tokio::time::sleep(Duration::from_millis(700)).await;

    let removed_later = queue.clean().await.expect("clean");
    assert_eq!(removed_later, 1);
}

#[sqlx::test(migrations = false)]
async fn migrate_upgrades_legacy_timestamp_columns(pool: PgPool) {
    let queue: Queue<String> = setup(&pool, "legacy", QueueOptions::default()).await;

    sqlx::query(
        r#"
        INSERT INTO "legacy" (payload, visible, legacy_deleted_text)
        VALUES ('"legacy"'::jsonb, NOW(), '2020-01-01T00:00:00Z')
        "#,
    )
    .execute(&pool)
    .await
    .expect("seed legacy row");

    let modified = queue.migrate().await.expect("migrate");
    assert_eq!(modified, 1);

    // A second pass is a no-op.
    let modified_again = queue.migrate().await.expect("migrate");
    assert_eq!(modified_again, 0);

    assert_eq!(queue.done().await.expect("done"), 1);
}
