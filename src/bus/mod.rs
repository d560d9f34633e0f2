//! Durable job bus over Postgres.
//!
//! Append-only per-topic logs with Redis-stream semantics: consumer groups,
//! a pending-entry list per group, stale-claim crash recovery and per-topic
//! dead-letter queues. Delivery is at-least-once within a group, FIFO per
//! topic within a single read.
//!
//! A single global sequence numbers all records, so ids are monotonic per
//! topic. Groups are created lazily at the current tail: a new group only
//! sees records published after its first read.

pub mod payload;

use crate::error::BusError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::Instant;

/// Topics consumed by the core worker. Additional topics may be published
/// and consumed without engine changes.
pub mod topics {
    pub const MAIL_SYNC: &str = "mail.sync";
    pub const MAIL_SEND: &str = "mail.send";
    pub const MAIL_BATCH: &str = "mail.batch";
    pub const MAIL_SAVE: &str = "mail.save";
    pub const MAIL_MODIFY: &str = "mail.modify";
    pub const CALENDAR_SYNC: &str = "calendar.sync";
    pub const AI_CLASSIFY: &str = "ai.classify";
    pub const AI_SUMMARIZE: &str = "ai.summarize";
    pub const AI_REPLY: &str = "ai.reply";
    pub const RAG_INDEX: &str = "rag.index";
    pub const RAG_BATCH_INDEX: &str = "rag.batch_index";

    pub const ALL: &[&str] = &[
        MAIL_SYNC,
        MAIL_SEND,
        MAIL_BATCH,
        MAIL_SAVE,
        MAIL_MODIFY,
        CALENDAR_SYNC,
        AI_CLASSIFY,
        AI_SUMMARIZE,
        AI_REPLY,
        RAG_INDEX,
        RAG_BATCH_INDEX,
    ];
}

/// Name of the dead-letter topic for `topic`.
pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// A delivered bus record.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub topic: String,
    pub id: i64,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: i32,
}

#[derive(Clone)]
pub struct Bus {
    pool: PgPool,
    poll_interval: Duration,
}

impl Bus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Append a record to `topic`. Durable at commit; the returned id is
    /// monotonic within the topic.
    pub async fn publish(&self, topic: &str, payload: &Value) -> Result<i64, BusError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO bus_records (topic, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(topic)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        log::debug!("bus: published {}/{}", topic, id);
        Ok(id)
    }

    /// Blocking read of up to `batch_size` records across `topics` not yet
    /// delivered to `group`. Blocks up to `block_timeout` when the topics are
    /// empty. The first read implicitly creates the group at the current tail.
    pub async fn subscribe(
        &self,
        group: &str,
        consumer: &str,
        topics: &[&str],
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<BusRecord>, BusError> {
        let deadline = Instant::now() + block_timeout;

        loop {
            let mut records = Vec::new();
            for topic in topics {
                let remaining = batch_size.saturating_sub(records.len());
                if remaining == 0 {
                    break;
                }
                records.extend(self.read_topic(group, consumer, topic, remaining).await?);
            }

            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One non-blocking read attempt against a single topic.
    async fn read_topic(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<BusRecord>, BusError> {
        let mut tx = self.pool.begin().await?;

        // Lazily create the group at the current tail: new-records-only.
        sqlx::query(
            r#"INSERT INTO bus_groups (group_name, topic, last_delivered_id)
               VALUES ($1, $2, COALESCE((SELECT MAX(id) FROM bus_records WHERE topic = $2), 0))
               ON CONFLICT (group_name, topic) DO NOTHING"#,
        )
        .bind(group)
        .bind(topic)
        .execute(&mut *tx)
        .await?;

        // Serialize readers of the same group+topic; FIFO per read follows.
        let (last_delivered,): (i64,) = sqlx::query_as(
            "SELECT last_delivered_id FROM bus_groups WHERE group_name = $1 AND topic = $2 FOR UPDATE",
        )
        .bind(group)
        .bind(topic)
        .fetch_one(&mut *tx)
        .await?;

        let rows: Vec<(i64, Value, DateTime<Utc>)> = sqlx::query_as(
            r#"SELECT id, payload, enqueued_at FROM bus_records
               WHERE topic = $1 AND id > $2
               ORDER BY id
               LIMIT $3"#,
        )
        .bind(topic)
        .bind(last_delivered)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|(id, ..)| *id).collect();
        sqlx::query(
            r#"INSERT INTO bus_pending (group_name, topic, record_id, consumer)
               SELECT $1, $2, record_id, $3 FROM UNNEST($4::bigint[]) AS t(record_id)"#,
        )
        .bind(group)
        .bind(topic)
        .bind(consumer)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        let max_id = *ids.last().unwrap_or(&last_delivered);
        sqlx::query(
            "UPDATE bus_groups SET last_delivered_id = $1 WHERE group_name = $2 AND topic = $3",
        )
        .bind(max_id)
        .bind(group)
        .bind(topic)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|(id, payload, enqueued_at)| BusRecord {
                topic: topic.to_string(),
                id,
                payload,
                enqueued_at,
                delivery_count: 1,
            })
            .collect())
    }

    /// Remove a record from the group's pending set. Acking a record that is
    /// not pending is a no-op.
    pub async fn ack(&self, group: &str, topic: &str, id: i64) -> Result<(), BusError> {
        sqlx::query(
            "DELETE FROM bus_pending WHERE group_name = $1 AND topic = $2 AND record_id = $3",
        )
        .bind(group)
        .bind(topic)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Transfer pending records idle past `older_than` from any consumer to
    /// `consumer`, incrementing their delivery counts. Crash recovery: records
    /// read by a consumer that died before acking become claimable.
    pub async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<BusRecord>, BusError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();

        let rows: Vec<(String, i64, Value, DateTime<Utc>, i32)> = sqlx::query_as(
            r#"WITH stale AS (
                   SELECT group_name, topic, record_id
                   FROM bus_pending
                   WHERE group_name = $1 AND delivered_at < $3
                   ORDER BY delivered_at
                   LIMIT $4
                   FOR UPDATE SKIP LOCKED
               ),
               claimed AS (
                   UPDATE bus_pending p
                   SET consumer = $2, delivered_at = NOW(), delivery_count = p.delivery_count + 1
                   FROM stale s
                   WHERE p.group_name = s.group_name
                     AND p.topic = s.topic
                     AND p.record_id = s.record_id
                   RETURNING p.topic, p.record_id, p.delivery_count
               )
               SELECT c.topic, c.record_id, r.payload, r.enqueued_at, c.delivery_count
               FROM claimed c
               JOIN bus_records r ON r.topic = c.topic AND r.id = c.record_id
               ORDER BY c.record_id"#,
        )
        .bind(group)
        .bind(consumer)
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        if !rows.is_empty() {
            log::info!("bus: consumer {} claimed {} stale records", consumer, rows.len());
        }

        Ok(rows
            .into_iter()
            .map(|(topic, id, payload, enqueued_at, delivery_count)| BusRecord {
                topic,
                id,
                payload,
                enqueued_at,
                delivery_count,
            })
            .collect())
    }

    /// Move a record to `{topic}.dlq`, preserving the payload and recording
    /// the failure reason. The record leaves every group's pending set.
    pub async fn dead_letter(&self, topic: &str, id: i64, reason: &str) -> Result<(), BusError> {
        let mut tx = self.pool.begin().await?;

        let payload: Option<(Value,)> =
            sqlx::query_as("SELECT payload FROM bus_records WHERE topic = $1 AND id = $2")
                .bind(topic)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((payload,)) = payload else {
            return Err(BusError::UnknownRecord {
                topic: topic.to_string(),
                id,
            });
        };

        sqlx::query("INSERT INTO bus_records (topic, payload, reason) VALUES ($1, $2, $3)")
            .bind(dlq_topic(topic))
            .bind(&payload)
            .bind(reason)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM bus_pending WHERE topic = $1 AND record_id = $2")
            .bind(topic)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM bus_records WHERE topic = $1 AND id = $2")
            .bind(topic)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        log::warn!("bus: dead-lettered {}/{}: {}", topic, id, reason);
        Ok(())
    }

    /// Number of records currently pending (delivered, unacked) for a group.
    pub async fn pending_count(&self, group: &str, topic: &str) -> Result<i64, BusError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bus_pending WHERE group_name = $1 AND topic = $2",
        )
        .bind(group)
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Total records currently stored for a topic.
    pub async fn topic_len(&self, topic: &str) -> Result<i64, BusError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM bus_records WHERE topic = $1")
                .bind(topic)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Delete records every existing group has delivered and acked.
    /// Maintenance only; consumers never depend on trimming.
    pub async fn trim_acked(&self, topic: &str) -> Result<u64, BusError> {
        let result = sqlx::query(
            r#"DELETE FROM bus_records r
               WHERE r.topic = $1
                 AND r.id <= (SELECT MIN(last_delivered_id) FROM bus_groups WHERE topic = $1)
                 AND NOT EXISTS (
                     SELECT 1 FROM bus_pending p
                     WHERE p.topic = r.topic AND p.record_id = r.id
                 )"#,
        )
        .bind(topic)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
