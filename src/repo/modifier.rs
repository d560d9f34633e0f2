//! Modifier queue, per-email version counter and conflict records.

use crate::models::{
    Conflict, ConflictResolution, ConflictType, Modifier, ModifierStatus, ModifierType,
    VersionSource,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Intake shape for a client mutation. The caller mints the id so retries of
/// the submit call stay idempotent.
#[derive(Debug, Clone)]
pub struct NewModifier {
    pub id: Uuid,
    pub user_id: Uuid,
    pub connection_id: i64,
    pub mod_type: ModifierType,
    pub email_id: Option<i64>,
    pub external_id: Option<String>,
    pub thread_id: Option<String>,
    pub params: Value,
    pub client_version: i64,
}

#[derive(Clone)]
pub struct ModifierRepository {
    pool: PgPool,
}

impl ModifierRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewModifier) -> Result<Modifier, sqlx::Error> {
        sqlx::query_as(
            r#"INSERT INTO modifiers
               (id, user_id, connection_id, mod_type, email_id, external_id,
                thread_id, params, client_version)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
               RETURNING *"#,
        )
        .bind(new.id)
        .bind(new.user_id)
        .bind(new.connection_id)
        .bind(new.mod_type)
        .bind(new.email_id)
        .bind(&new.external_id)
        .bind(&new.thread_id)
        .bind(&new.params)
        .bind(new.client_version)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Modifier>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM modifiers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Pending modifiers for a connection in submission order; application
    /// preserves this order per email.
    pub async fn get_pending_by_connection(
        &self,
        connection_id: i64,
    ) -> Result<Vec<Modifier>, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT * FROM modifiers
               WHERE connection_id = $1 AND status = 'pending'
               ORDER BY created_at, id"#,
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn mark_applied(&self, id: Uuid, server_version: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE modifiers
               SET status = 'applied', server_version = $2, applied_at = NOW(), last_error = NULL
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(server_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_retry(&self, id: Uuid, error: &str) -> Result<i32, sqlx::Error> {
        let (retry_count,): (i32,) = sqlx::query_as(
            r#"UPDATE modifiers
               SET retry_count = retry_count + 1, last_error = $2
               WHERE id = $1
               RETURNING retry_count"#,
        )
        .bind(id)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(retry_count)
    }

    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE modifiers
               SET status = 'failed', failed_at = NOW(), last_error = $2
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_conflict(&self, id: Uuid, server_version: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE modifiers SET status = 'conflict', server_version = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(server_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-queue a conflicted modifier under a resolution policy, adopting the
    /// version the user saw at resolution time.
    pub async fn requeue_with_version(
        &self,
        id: Uuid,
        client_version: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE modifiers
               SET status = 'pending', client_version = $2, retry_count = 0, last_error = NULL
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(client_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current server version for an email; zero when no mutation has been
    /// accepted yet.
    pub async fn get_version(&self, email_id: i64) -> Result<i64, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM email_versions WHERE email_id = $1")
                .bind(email_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(v,)| v).unwrap_or(0))
    }

    /// Bump the per-email version after a server-accepted mutation and return
    /// the new value.
    pub async fn bump_version(
        &self,
        email_id: i64,
        mod_type: ModifierType,
        source: VersionSource,
    ) -> Result<i64, sqlx::Error> {
        let mod_type = serde_json::to_value(mod_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let (version,): (i64,) = sqlx::query_as(
            r#"INSERT INTO email_versions (email_id, version, mod_type, mod_source, mod_at)
               VALUES ($1, 1, $2, $3, NOW())
               ON CONFLICT (email_id) DO UPDATE SET
                   version = email_versions.version + 1,
                   mod_type = EXCLUDED.mod_type,
                   mod_source = EXCLUDED.mod_source,
                   mod_at = NOW()
               RETURNING version"#,
        )
        .bind(email_id)
        .bind(mod_type)
        .bind(source)
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }

    pub async fn create_conflict(
        &self,
        modifier_id: Uuid,
        conflict_type: ConflictType,
        client_state: Value,
        server_state: Value,
    ) -> Result<Conflict, sqlx::Error> {
        sqlx::query_as(
            r#"INSERT INTO conflicts (modifier_id, conflict_type, client_state, server_state)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(modifier_id)
        .bind(conflict_type)
        .bind(client_state)
        .bind(server_state)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_conflict_by_modifier(
        &self,
        modifier_id: Uuid,
    ) -> Result<Option<Conflict>, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT * FROM conflicts
               WHERE modifier_id = $1 AND resolution IS NULL
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(modifier_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: i64,
        resolution: ConflictResolution,
        resolved_by: Option<Uuid>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE conflicts
               SET resolution = $2, resolved_at = NOW(), resolved_by = $3
               WHERE id = $1"#,
        )
        .bind(conflict_id)
        .bind(resolution)
        .bind(resolved_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop applied modifiers older than the cutoff; the version table keeps
    /// the durable audit line.
    pub async fn cleanup_applied_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM modifiers WHERE status = 'applied' AND applied_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_by_status(
        &self,
        connection_id: i64,
        status: ModifierStatus,
    ) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM modifiers WHERE connection_id = $1 AND status = $2",
        )
        .bind(connection_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
