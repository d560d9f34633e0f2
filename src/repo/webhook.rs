//! Webhook channel persistence. One row per `(connection_id, resource_type)`.

use crate::models::{ProviderKind, Webhook, WebhookStatus};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub connection_id: i64,
    pub provider: ProviderKind,
    pub resource_type: String,
    pub subscription_id: String,
    pub resource_id: Option<String>,
    pub channel_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WebhookRepository {
    pool: PgPool,
}

impl WebhookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or replace the channel for `(connection_id, resource_type)`.
    /// Re-setup resets the failure counter.
    pub async fn upsert(&self, new: &NewWebhook) -> Result<Webhook, sqlx::Error> {
        sqlx::query_as(
            r#"INSERT INTO webhooks
               (connection_id, provider, resource_type, subscription_id, resource_id,
                channel_id, status, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, 'active', $7)
               ON CONFLICT (connection_id, resource_type) DO UPDATE SET
                   subscription_id = EXCLUDED.subscription_id,
                   resource_id = EXCLUDED.resource_id,
                   channel_id = EXCLUDED.channel_id,
                   status = 'active',
                   failure_count = 0,
                   expires_at = EXCLUDED.expires_at,
                   last_renewed_at = NOW(),
                   last_error = NULL
               RETURNING *"#,
        )
        .bind(new.connection_id)
        .bind(new.provider)
        .bind(&new.resource_type)
        .bind(&new.subscription_id)
        .bind(&new.resource_id)
        .bind(&new.channel_id)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_by_connection(
        &self,
        connection_id: i64,
        resource_type: &str,
    ) -> Result<Option<Webhook>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM webhooks WHERE connection_id = $1 AND resource_type = $2",
        )
        .bind(connection_id)
        .bind(resource_type)
        .fetch_optional(&self.pool)
        .await
    }

    /// Resolve an inbound push by subscription id, falling back to the
    /// provider resource id (Gmail identifies pushes by topic/resource).
    pub async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Webhook>, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT * FROM webhooks
               WHERE subscription_id = $1 OR resource_id = $1 OR channel_id = $1
               LIMIT 1"#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_active(&self) -> Result<Vec<Webhook>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM webhooks WHERE status = 'active' ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    /// Active channels expiring before the cutoff, soonest first.
    pub async fn list_expiring(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Webhook>, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT * FROM webhooks
               WHERE status = 'active' AND expires_at < $1
               ORDER BY expires_at"#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn update_status(
        &self,
        id: i64,
        status: WebhookStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE webhooks SET status = $2, last_error = COALESCE($3, last_error) WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_expiration(
        &self,
        id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE webhooks
               SET expires_at = $2, last_renewed_at = NOW(), failure_count = 0,
                   status = 'active', last_error = NULL
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_triggered(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE webhooks SET last_triggered_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_failure_count(
        &self,
        id: i64,
        error: &str,
    ) -> Result<i32, sqlx::Error> {
        let (failure_count,): (i32,) = sqlx::query_as(
            r#"UPDATE webhooks
               SET failure_count = failure_count + 1, last_error = $2
               WHERE id = $1
               RETURNING failure_count"#,
        )
        .bind(id)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(failure_count)
    }

    pub async fn disable_for_connection(&self, connection_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE webhooks SET status = 'disabled' WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
