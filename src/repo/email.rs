//! Mail metadata persistence.
//!
//! Writes are idempotent upserts keyed `(connection_id, external_id)`, so
//! duplicate deliveries of the same sync step converge. Batches go through
//! `jsonb_to_recordset` in a single statement; the checkpoint that covers a
//! batch commits on the same transaction.

use crate::models::{Attachment, Mail, MailDirection, PENDING_ATTACHMENT_PREFIX};
use crate::provider::{RemoteAttachment, RemoteMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

/// A mail row ready to upsert. Field names match the column names.
#[derive(Debug, Clone, Serialize)]
pub struct MailDraft {
    pub user_id: Uuid,
    pub connection_id: i64,
    pub external_id: String,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references_ids: Vec<String>,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub cc_addrs: Vec<String>,
    pub bcc_addrs: Vec<String>,
    pub subject: String,
    pub snippet: String,
    pub direction: MailDirection,
    pub is_read: bool,
    pub is_draft: bool,
    pub has_attachment: bool,
    pub folder: String,
    pub labels: Vec<String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl MailDraft {
    pub fn from_remote(user_id: Uuid, connection_id: i64, remote: &RemoteMessage) -> Self {
        Self {
            user_id,
            connection_id,
            external_id: remote.external_id.clone(),
            thread_id: remote.thread_id.clone(),
            message_id: remote.message_id.clone(),
            in_reply_to: remote.in_reply_to.clone(),
            references_ids: remote.references.clone(),
            from_addr: remote.from.clone(),
            to_addrs: remote.to.clone(),
            cc_addrs: remote.cc.clone(),
            bcc_addrs: remote.bcc.clone(),
            subject: remote.subject.clone(),
            snippet: remote.snippet.clone(),
            direction: if remote.is_outbound {
                MailDirection::Outbound
            } else {
                MailDirection::Inbound
            },
            is_read: remote.is_read,
            is_draft: remote.is_draft,
            has_attachment: remote.has_attachment,
            folder: remote.folder.clone(),
            labels: remote.labels.clone(),
            received_at: remote.received_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UpsertedMail {
    pub id: i64,
    pub external_id: String,
    pub inserted: bool,
}

/// Filters for the windowed listing.
#[derive(Debug, Clone, Default)]
pub struct MailListQuery {
    pub user_id: Uuid,
    pub connection_id: Option<i64>,
    pub folder: Option<String>,
    pub is_read: Option<bool>,
    pub label: Option<String>,
    pub workflow_status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AiResult {
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub priority: Option<f32>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Clone)]
pub struct EmailRepository {
    pool: PgPool,
}

impl EmailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent batch upsert. `inserted` is false for rows that already
    /// existed; AI columns and workflow state survive re-upserts untouched.
    pub async fn bulk_upsert(
        conn: &mut PgConnection,
        drafts: &[MailDraft],
    ) -> Result<Vec<UpsertedMail>, sqlx::Error> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = serde_json::to_value(drafts)
            .map_err(|err| sqlx::Error::Encode(Box::new(err)))?;

        let rows: Vec<UpsertedMail> = sqlx::query_as(
            r#"INSERT INTO mails (
                   user_id, connection_id, external_id, thread_id, message_id,
                   in_reply_to, references_ids, from_addr, to_addrs, cc_addrs,
                   bcc_addrs, subject, snippet, direction, is_read, is_draft,
                   has_attachment, folder, labels, received_at
               )
               SELECT user_id, connection_id, external_id, thread_id, message_id,
                      in_reply_to, COALESCE(references_ids, '{}'), from_addr,
                      COALESCE(to_addrs, '{}'), COALESCE(cc_addrs, '{}'),
                      COALESCE(bcc_addrs, '{}'), subject, snippet, direction,
                      is_read, is_draft, has_attachment, folder,
                      COALESCE(labels, '{}'), received_at
               FROM jsonb_to_recordset($1::jsonb) AS t(
                   user_id uuid, connection_id bigint, external_id text,
                   thread_id text, message_id text, in_reply_to text,
                   references_ids text[], from_addr text, to_addrs text[],
                   cc_addrs text[], bcc_addrs text[], subject text,
                   snippet text, direction mail_direction, is_read boolean,
                   is_draft boolean, has_attachment boolean, folder text,
                   labels text[], received_at timestamptz
               )
               ON CONFLICT (connection_id, external_id) DO UPDATE SET
                   thread_id = EXCLUDED.thread_id,
                   message_id = EXCLUDED.message_id,
                   in_reply_to = EXCLUDED.in_reply_to,
                   references_ids = EXCLUDED.references_ids,
                   from_addr = EXCLUDED.from_addr,
                   to_addrs = EXCLUDED.to_addrs,
                   cc_addrs = EXCLUDED.cc_addrs,
                   bcc_addrs = EXCLUDED.bcc_addrs,
                   subject = EXCLUDED.subject,
                   snippet = EXCLUDED.snippet,
                   direction = EXCLUDED.direction,
                   is_read = EXCLUDED.is_read,
                   is_draft = EXCLUDED.is_draft,
                   has_attachment = EXCLUDED.has_attachment,
                   folder = EXCLUDED.folder,
                   labels = EXCLUDED.labels,
                   received_at = EXCLUDED.received_at,
                   updated_at = NOW()
               RETURNING id, external_id, (xmax = 0) AS inserted"#,
        )
        .bind(payload)
        .fetch_all(conn)
        .await?;

        log::trace!("bulk upserted {} mails", rows.len());
        Ok(rows)
    }

    /// Pool-based convenience wrapper for single upserts.
    pub async fn upsert(&self, draft: &MailDraft) -> Result<UpsertedMail, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let mut rows = Self::bulk_upsert(&mut conn, std::slice::from_ref(draft)).await?;
        rows.pop().ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Mail>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM mails WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_by_external_id(
        &self,
        connection_id: i64,
        external_id: &str,
    ) -> Result<Option<Mail>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM mails WHERE connection_id = $1 AND external_id = $2")
            .bind(connection_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_by_external_ids(
        &self,
        connection_id: i64,
        external_ids: &[String],
    ) -> Result<Vec<Mail>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM mails WHERE connection_id = $1 AND external_id = ANY($2)",
        )
        .bind(connection_id)
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await
    }

    /// Windowed listing: rows plus the filtered total in one round trip via
    /// `COUNT(*) OVER ()`.
    pub async fn list(&self, query: &MailListQuery) -> Result<(Vec<Mail>, i64), sqlx::Error> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT *, COUNT(*) OVER () AS total FROM mails WHERE user_id = ");
        builder.push_bind(query.user_id);

        if let Some(connection_id) = query.connection_id {
            builder.push(" AND connection_id = ");
            builder.push_bind(connection_id);
        }
        if let Some(folder) = &query.folder {
            builder.push(" AND folder = ");
            builder.push_bind(folder);
        }
        if let Some(is_read) = query.is_read {
            builder.push(" AND is_read = ");
            builder.push_bind(is_read);
        }
        if let Some(label) = &query.label {
            builder.push(" AND ");
            builder.push_bind(label);
            builder.push(" = ANY(labels)");
        }
        if let Some(workflow) = &query.workflow_status {
            builder.push(" AND workflow_status = ");
            builder.push_bind(workflow);
        }

        builder.push(" ORDER BY received_at DESC NULLS LAST, id DESC LIMIT ");
        builder.push_bind(query.limit.clamp(1, 200));
        builder.push(" OFFSET ");
        builder.push_bind(query.offset.max(0));

        let rows = builder.build().fetch_all(&self.pool).await?;

        let total = rows
            .first()
            .map(|row| row.try_get::<i64, _>("total"))
            .transpose()?
            .unwrap_or(0);
        let mails = rows
            .iter()
            .map(|row| sqlx::FromRow::from_row(row))
            .collect::<Result<Vec<Mail>, _>>()?;

        Ok((mails, total))
    }

    pub async fn count_unclassified(&self, connection_id: i64) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM mails WHERE connection_id = $1 AND ai_status = 'pending'",
        )
        .bind(connection_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn update_read_status(&self, id: i64, is_read: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE mails SET is_read = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(is_read)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_folder(&self, id: i64, folder: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE mails SET folder = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(folder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_label(&self, id: i64, label: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE mails
               SET labels = array_append(labels, $2), updated_at = NOW()
               WHERE id = $1 AND NOT ($2 = ANY(labels))"#,
        )
        .bind(id)
        .bind(label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_label(&self, id: i64, label: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE mails SET labels = array_remove(labels, $2), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_workflow_status(
        &self,
        id: i64,
        workflow_status: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE mails SET workflow_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(workflow_status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applied by an incremental label change: the full new label set plus
    /// the read/folder state derived from it.
    pub async fn update_labels_state(
        &self,
        id: i64,
        labels: &[String],
        is_read: bool,
        folder: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE mails
               SET labels = $2, is_read = $3, folder = $4, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(labels)
        .bind(is_read)
        .bind(folder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store the classification result. Out-of-range priorities are coerced
    /// to NULL at this boundary rather than rejected.
    pub async fn update_ai_result(&self, id: i64, result: &AiResult) -> Result<(), sqlx::Error> {
        let priority = result
            .priority
            .filter(|p| p.is_finite() && (0.0..=1.0).contains(p));

        sqlx::query(
            r#"UPDATE mails
               SET ai_status = 'classified',
                   ai_category = $2,
                   ai_sub_category = $3,
                   ai_priority = $4,
                   ai_summary = $5,
                   ai_tags = $6,
                   updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(&result.category)
        .bind(&result.sub_category)
        .bind(priority)
        .bind(&result.summary)
        .bind(&result.tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_by_external_id(
        &self,
        connection_id: i64,
        external_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM mails WHERE connection_id = $1 AND external_id = $2")
                .bind(connection_id)
                .bind(external_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace the attachment set for a mail. Runs on the caller's
    /// transaction alongside the owning upsert.
    pub async fn replace_attachments(
        conn: &mut PgConnection,
        email_id: i64,
        attachments: &[RemoteAttachment],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM attachments WHERE email_id = $1")
            .bind(email_id)
            .execute(&mut *conn)
            .await?;

        for attachment in attachments {
            sqlx::query(
                r#"INSERT INTO attachments
                   (email_id, external_id, filename, mime_type, size, content_id, is_inline)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(email_id)
            .bind(&attachment.external_id)
            .bind(&attachment.filename)
            .bind(&attachment.mime_type)
            .bind(attachment.size)
            .bind(&attachment.content_id)
            .bind(attachment.is_inline)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    pub async fn list_attachments(&self, email_id: i64) -> Result<Vec<Attachment>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM attachments WHERE email_id = $1 ORDER BY id")
            .bind(email_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Rewrite a `pending_…` sentinel once the real provider id is known.
    pub async fn resolve_pending_attachment(
        &self,
        attachment_id: i64,
        external_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE attachments
               SET external_id = $2
               WHERE id = $1 AND external_id LIKE $3"#,
        )
        .bind(attachment_id)
        .bind(external_id)
        .bind(format!("{PENDING_ATTACHMENT_PREFIX}%"))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
