//! Stream-log semantics of the job bus: group creation at the tail, pending
//! tracking, stale claims, dead-lettering and FIFO delivery.

use serde_json::json;
use std::time::{Duration, Instant};
use sync_worker::bus::{Bus, dlq_topic};
use sync_worker::test_support::TestDatabase;

const TOPIC: &str = "mail.sync";

#[tokio::test]
async fn groups_start_at_the_tail_and_see_only_new_records() {
    let db = TestDatabase::new().await.expect("test database");
    let bus = Bus::new(db.pool_clone());

    // Published before the group exists; invisible to it.
    bus.publish(TOPIC, &json!({"n": 1})).await.expect("publish");

    let records = bus
        .subscribe("workers", "c1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");
    assert!(records.is_empty(), "group starts at the current tail");

    let id2 = bus.publish(TOPIC, &json!({"n": 2})).await.expect("publish");
    let records = bus
        .subscribe("workers", "c1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id2);
    assert_eq!(records[0].payload, json!({"n": 2}));
    assert_eq!(records[0].delivery_count, 1);

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn delivery_is_fifo_within_a_read() {
    let db = TestDatabase::new().await.expect("test database");
    let bus = Bus::new(db.pool_clone());

    // Create the group first so the records below are visible.
    bus.subscribe("workers", "c1", &[TOPIC], 1, Duration::from_millis(50))
        .await
        .expect("subscribe");

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(bus.publish(TOPIC, &json!({ "n": n })).await.expect("publish"));
    }

    let records = bus
        .subscribe("workers", "c1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");

    let delivered: Vec<i64> = records.iter().map(|r| r.id).collect();
    assert_eq!(delivered, ids, "records arrive in publish order");

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn ack_removes_the_pending_entry() {
    let db = TestDatabase::new().await.expect("test database");
    let bus = Bus::new(db.pool_clone());

    bus.subscribe("workers", "c1", &[TOPIC], 1, Duration::from_millis(50))
        .await
        .expect("subscribe");
    let id = bus.publish(TOPIC, &json!({"x": 1})).await.expect("publish");

    let records = bus
        .subscribe("workers", "c1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");
    assert_eq!(records.len(), 1);
    assert_eq!(bus.pending_count("workers", TOPIC).await.expect("count"), 1);

    bus.ack("workers", TOPIC, id).await.expect("ack");
    assert_eq!(bus.pending_count("workers", TOPIC).await.expect("count"), 0);

    // Acking again is a no-op.
    bus.ack("workers", TOPIC, id).await.expect("ack twice");

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn unacked_records_become_claimable_by_another_consumer() {
    let db = TestDatabase::new().await.expect("test database");
    let bus = Bus::new(db.pool_clone());

    bus.subscribe("workers", "c1", &[TOPIC], 1, Duration::from_millis(50))
        .await
        .expect("subscribe");
    let id = bus.publish(TOPIC, &json!({"job": "sync"})).await.expect("publish");

    // c1 reads but never acks (simulated crash).
    let records = bus
        .subscribe("workers", "c1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");
    assert_eq!(records.len(), 1);

    // Not yet idle long enough.
    let none = bus
        .claim_stale("workers", "c2", Duration::from_secs(60), 10)
        .await
        .expect("claim");
    assert!(none.is_empty());

    // Idle past the threshold: c2 adopts the record and the delivery count
    // reflects the second delivery.
    let claimed = bus
        .claim_stale("workers", "c2", Duration::from_millis(0), 10)
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].delivery_count, 2);

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn dead_letter_moves_the_record_with_its_reason() {
    let db = TestDatabase::new().await.expect("test database");
    let bus = Bus::new(db.pool_clone());

    bus.subscribe("workers", "c1", &[TOPIC], 1, Duration::from_millis(50))
        .await
        .expect("subscribe");
    let id = bus.publish(TOPIC, &json!({"bad": true})).await.expect("publish");
    bus.subscribe("workers", "c1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");

    bus.dead_letter(TOPIC, id, "handler kept failing")
        .await
        .expect("dead letter");

    assert_eq!(bus.topic_len(TOPIC).await.expect("len"), 0);
    assert_eq!(bus.topic_len(&dlq_topic(TOPIC)).await.expect("len"), 1);
    assert_eq!(bus.pending_count("workers", TOPIC).await.expect("count"), 0);

    let (payload, reason): (serde_json::Value, Option<String>) = sqlx::query_as(
        "SELECT payload, reason FROM bus_records WHERE topic = $1",
    )
    .bind(dlq_topic(TOPIC))
    .fetch_one(db.pool())
    .await
    .expect("dlq row");
    assert_eq!(payload, json!({"bad": true}));
    assert_eq!(reason.as_deref(), Some("handler kept failing"));

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn empty_subscribe_blocks_up_to_the_timeout() {
    let db = TestDatabase::new().await.expect("test database");
    let bus = Bus::new(db.pool_clone());

    let started = Instant::now();
    let records = bus
        .subscribe("workers", "c1", &[TOPIC], 10, Duration::from_millis(300))
        .await
        .expect("subscribe");

    assert!(records.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(3));

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn trim_drops_records_every_group_has_acked() {
    let db = TestDatabase::new().await.expect("test database");
    let bus = Bus::new(db.pool_clone());

    bus.subscribe("workers", "c1", &[TOPIC], 1, Duration::from_millis(50))
        .await
        .expect("subscribe");
    let id = bus.publish(TOPIC, &json!({"n": 1})).await.expect("publish");
    bus.subscribe("workers", "c1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");

    // Still pending: trim must not touch it.
    assert_eq!(bus.trim_acked(TOPIC).await.expect("trim"), 0);

    bus.ack("workers", TOPIC, id).await.expect("ack");
    assert_eq!(bus.trim_acked(TOPIC).await.expect("trim"), 1);
    assert_eq!(bus.topic_len(TOPIC).await.expect("len"), 0);

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn separate_groups_track_deliveries_independently() {
    let db = TestDatabase::new().await.expect("test database");
    let bus = Bus::new(db.pool_clone());

    bus.subscribe("alpha", "a1", &[TOPIC], 1, Duration::from_millis(50))
        .await
        .expect("subscribe");
    bus.subscribe("beta", "b1", &[TOPIC], 1, Duration::from_millis(50))
        .await
        .expect("subscribe");

    let id = bus.publish(TOPIC, &json!({"n": 1})).await.expect("publish");

    let alpha = bus
        .subscribe("alpha", "a1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");
    let beta = bus
        .subscribe("beta", "b1", &[TOPIC], 10, Duration::from_millis(100))
        .await
        .expect("subscribe");

    assert_eq!(alpha.len(), 1);
    assert_eq!(beta.len(), 1);

    // Alpha acks; beta's pending entry is untouched.
    bus.ack("alpha", TOPIC, id).await.expect("ack");
    assert_eq!(bus.pending_count("alpha", TOPIC).await.expect("count"), 0);
    assert_eq!(bus.pending_count("beta", TOPIC).await.expect("count"), 1);

    db.close().await.expect("drop test database");
}
