use crate::models::{Connection, ProviderKind};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub account_email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub is_default: bool,
}

#[derive(Clone)]
pub struct ConnectionRepository {
    pool: PgPool,
}

impl ConnectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the connection and its sync state row in one transaction.
    pub async fn create(&self, new: NewConnection) -> Result<Connection, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let connection: Connection = sqlx::query_as(
            r#"INSERT INTO connections
               (user_id, provider, account_email, access_token, refresh_token, expires_at, is_default)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(new.user_id)
        .bind(new.provider)
        .bind(&new.account_email)
        .bind(&new.access_token)
        .bind(&new.refresh_token)
        .bind(new.expires_at)
        .bind(new.is_default)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO sync_states (connection_id) VALUES ($1)")
            .bind(connection.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(connection)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Connection>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Connection>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM connections WHERE user_id = $1 ORDER BY is_default DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Resolve a provider push notification to its connection.
    pub async fn find_by_email(
        &self,
        provider: ProviderKind,
        account_email: &str,
    ) -> Result<Option<Connection>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM connections WHERE provider = $1 AND account_email = $2 LIMIT 1",
        )
        .bind(provider)
        .bind(account_email)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_connected(&self) -> Result<Vec<Connection>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM connections WHERE is_connected = TRUE ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    /// Persist rotated tokens. A missing refresh token keeps the stored one.
    pub async fn update_tokens(
        &self,
        id: i64,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE connections
               SET access_token = $2,
                   refresh_token = COALESCE($3, refresh_token),
                   expires_at = $4,
                   updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_disconnected(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE connections SET is_connected = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_connected(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE connections SET is_connected = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_default(&self, user_id: Uuid, id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE connections SET is_default = FALSE WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE connections SET is_default = TRUE WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Deleting cascades to sync state, webhooks, mails, bodies, attachments
    /// and modifiers via foreign keys.
    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM connections WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
