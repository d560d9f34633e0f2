//! Sync state persistence with atomic transition helpers.
//!
//! Every state transition the engine makes is a single guarded UPDATE, so
//! invariants hold regardless of interleaving: the history cursor never
//! decreases, retry scheduling flips to terminal error exactly at the retry
//! budget, and `first_sync_completed_at` is written once.

use crate::models::{SyncPhase, SyncState, SyncStatus};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use uuid::Uuid;

/// A retry whose due time has passed, joined with what the resume job needs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetryDue {
    pub connection_id: i64,
    pub user_id: Uuid,
    pub phase: SyncPhase,
    pub checkpoint_page_token: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StaleConnection {
    pub connection_id: i64,
    pub user_id: Uuid,
}

#[derive(Clone)]
pub struct SyncStateRepository {
    pool: PgPool,
}

impl SyncStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, connection_id: i64) -> Result<Option<SyncState>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM sync_states WHERE connection_id = $1")
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Create the row if the connection predates the sync-state table, then
    /// return it.
    pub async fn ensure(&self, connection_id: i64) -> Result<SyncState, sqlx::Error> {
        sqlx::query(
            "INSERT INTO sync_states (connection_id) VALUES ($1) ON CONFLICT (connection_id) DO NOTHING",
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await?;

        sqlx::query_as("SELECT * FROM sync_states WHERE connection_id = $1")
            .bind(connection_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Atomically claim the backfill. Fails when a backfill is already
    /// running, which is how `initial_sync` rejects double starts.
    pub async fn try_begin_backfill(&self, connection_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE sync_states
               SET status = 'backfilling', phase = 'initial', failed_at = NULL,
                   last_error = NULL, updated_at = NOW()
               WHERE connection_id = $1 AND status <> 'backfilling'"#,
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(
        &self,
        connection_id: i64,
        status: SyncStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE sync_states SET status = $2, updated_at = NOW() WHERE connection_id = $1",
        )
        .bind(connection_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist the resumable backfill cursor. Runs on the caller's
    /// transaction so the checkpoint commits with the mail batch it covers.
    pub async fn save_checkpoint(
        conn: &mut PgConnection,
        connection_id: i64,
        page_token: Option<&str>,
        synced_count: i64,
        total_count: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_states
               SET checkpoint_page_token = $2,
                   checkpoint_synced_count = $3,
                   checkpoint_total_count = $4,
                   updated_at = NOW()
               WHERE connection_id = $1"#,
        )
        .bind(connection_id)
        .bind(page_token)
        .bind(synced_count)
        .bind(total_count)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub async fn clear_checkpoint(&self, connection_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_states
               SET checkpoint_page_token = NULL,
                   checkpoint_synced_count = 0,
                   checkpoint_total_count = 0,
                   updated_at = NOW()
               WHERE connection_id = $1"#,
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Finish the initial backfill: clear the checkpoint, fold the synced
    /// count into the running total, move to idle and stamp
    /// `first_sync_completed_at` exactly once.
    pub async fn mark_first_sync_complete(
        &self,
        connection_id: i64,
        synced: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_states
               SET checkpoint_page_token = NULL,
                   checkpoint_synced_count = 0,
                   checkpoint_total_count = 0,
                   total_synced = total_synced + $2,
                   status = 'idle',
                   phase = 'incremental',
                   retry_count = 0,
                   next_retry_at = NULL,
                   last_sync_at = NOW(),
                   first_sync_completed_at = COALESCE(first_sync_completed_at, NOW()),
                   updated_at = NOW()
               WHERE connection_id = $1"#,
        )
        .bind(connection_id)
        .bind(synced)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Advance the history cursor, never backwards. Numeric cursors compare
    /// as numbers (length, then lexicographic; valid for unpadded decimals);
    /// opaque cursors (Graph delta links) always replace. Returns whether the
    /// cursor moved.
    pub async fn update_history_cursor_if_greater(
        &self,
        connection_id: i64,
        cursor: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE sync_states
               SET history_cursor = $2, updated_at = NOW()
               WHERE connection_id = $1
                 AND (
                     history_cursor IS NULL
                     OR NOT ($2 ~ '^[0-9]+$' AND history_cursor ~ '^[0-9]+$')
                     OR (length($2), $2) > (length(history_cursor), history_cursor)
                 )"#,
        )
        .bind(connection_id)
        .bind(cursor)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Schedule the next retry, or flip to terminal error once the budget is
    /// exhausted. At `retry_count == max_retries` the transition is to
    /// `error`, not another retry. Returns the resulting status.
    pub async fn schedule_retry(
        &self,
        connection_id: i64,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<SyncStatus, sqlx::Error> {
        let (status,): (SyncStatus,) = sqlx::query_as(
            r#"UPDATE sync_states
               SET status = CASE WHEN retry_count >= max_retries
                                 THEN 'error'::sync_status
                                 ELSE 'retry_scheduled'::sync_status END,
                   failed_at = CASE WHEN retry_count >= max_retries THEN NOW() ELSE failed_at END,
                   next_retry_at = CASE WHEN retry_count >= max_retries THEN NULL ELSE $2 END,
                   retry_count = CASE WHEN retry_count >= max_retries
                                      THEN retry_count
                                      ELSE retry_count + 1 END,
                   last_error = $3,
                   updated_at = NOW()
               WHERE connection_id = $1
               RETURNING status"#,
        )
        .bind(connection_id)
        .bind(next_retry_at)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(status)
    }

    pub async fn mark_failed(&self, connection_id: i64, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_states
               SET status = 'error', failed_at = NOW(), next_retry_at = NULL,
                   last_error = $2, updated_at = NOW()
               WHERE connection_id = $1"#,
        )
        .bind(connection_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a successful sync step: idle status, fresh `last_sync_at`, a
    /// smoothed duration average and the synced-count delta.
    pub async fn record_sync_success(
        &self,
        connection_id: i64,
        duration_ms: i64,
        synced_delta: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_states
               SET status = 'idle',
                   retry_count = 0,
                   next_retry_at = NULL,
                   last_error = NULL,
                   last_sync_at = NOW(),
                   total_synced = total_synced + $3,
                   avg_sync_duration_ms = CASE WHEN avg_sync_duration_ms = 0
                                               THEN $2
                                               ELSE (avg_sync_duration_ms * 4 + $2) / 5 END,
                   updated_at = NOW()
               WHERE connection_id = $1"#,
        )
        .bind(connection_id)
        .bind(duration_ms)
        .bind(synced_delta)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retries whose due time has passed, budget permitting.
    pub async fn get_pending_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetryDue>, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT s.connection_id, c.user_id, s.phase, s.checkpoint_page_token
               FROM sync_states s
               JOIN connections c ON c.id = s.connection_id
               WHERE s.status = 'retry_scheduled'
                 AND s.next_retry_at IS NOT NULL
                 AND s.next_retry_at <= $1
                 AND s.retry_count <= s.max_retries
                 AND c.is_connected = TRUE
               ORDER BY s.next_retry_at"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Move a due retry back into its working state before republishing.
    pub async fn resume(&self, connection_id: i64, phase: SyncPhase) -> Result<(), sqlx::Error> {
        let status = match phase {
            SyncPhase::Initial => SyncStatus::Backfilling,
            SyncPhase::Incremental => SyncStatus::Incremental,
        };

        sqlx::query(
            r#"UPDATE sync_states
               SET status = $2, next_retry_at = NULL, updated_at = NOW()
               WHERE connection_id = $1 AND status = 'retry_scheduled'"#,
        )
        .bind(connection_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Connections overdue for a sync: no recent `last_sync_at`, or an
    /// already-expired watch. Backfilling/retrying/terminal connections are
    /// excluded; they are driven elsewhere.
    pub async fn get_stale_connections(
        &self,
        stale_after: Duration,
    ) -> Result<Vec<StaleConnection>, sqlx::Error> {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or_default();

        sqlx::query_as(
            r#"SELECT s.connection_id, c.user_id
               FROM sync_states s
               JOIN connections c ON c.id = s.connection_id
               WHERE c.is_connected = TRUE
                 AND s.status IN ('idle', 'watch_expired')
                 AND (
                     s.last_sync_at IS NULL
                     OR s.last_sync_at < $1
                     OR (s.watch_expiry IS NOT NULL AND s.watch_expiry < NOW())
                 )
               ORDER BY s.last_sync_at NULLS FIRST"#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn set_watch(
        &self,
        connection_id: i64,
        expiry: DateTime<Utc>,
        resource_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_states
               SET watch_expiry = $2, watch_resource_id = $3,
                   status = CASE WHEN status = 'watch_expired' THEN 'idle' ELSE status END,
                   updated_at = NOW()
               WHERE connection_id = $1"#,
        )
        .bind(connection_id)
        .bind(expiry)
        .bind(resource_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_watch_expired(&self, connection_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_states
               SET status = 'watch_expired', updated_at = NOW()
               WHERE connection_id = $1 AND status = 'idle'"#,
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
