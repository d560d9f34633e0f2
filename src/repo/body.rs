//! Mail body storage with transparent gzip.
//!
//! Bodies strictly larger than the configured threshold (default 1024 bytes,
//! measured over html + text together) are stored gzip-compressed; a body of
//! exactly the threshold stays raw. Rows expire after their TTL and are
//! reaped by `cleanup_expired`.

use crate::config::BodyStoreConfig;
use crate::models::MailBody;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::io::{Read, Write};

#[derive(Debug, Clone)]
pub struct BodyDraft {
    pub email_id: i64,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments_meta: Value,
}

#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct CompressionStats {
    pub bodies: i64,
    pub compressed: i64,
    pub total_original: i64,
    pub total_compressed: i64,
}

#[derive(Clone)]
pub struct MailBodyRepository {
    pool: PgPool,
    config: BodyStoreConfig,
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

struct EncodedBody {
    html: Option<Vec<u8>>,
    text: Option<Vec<u8>>,
    is_compressed: bool,
    original_size: i64,
    compressed_size: i64,
}

impl MailBodyRepository {
    pub fn new(pool: PgPool, config: BodyStoreConfig) -> Self {
        Self { pool, config }
    }

    fn encode(&self, html: Option<&str>, text: Option<&str>) -> std::io::Result<EncodedBody> {
        let original_size = (html.map(str::len).unwrap_or(0)
            + text.map(str::len).unwrap_or(0)) as i64;
        let compress = original_size > self.config.gzip_threshold as i64;

        let encode_field = |field: Option<&str>| -> std::io::Result<Option<Vec<u8>>> {
            match field {
                Some(value) if compress => Ok(Some(gzip(value.as_bytes())?)),
                Some(value) => Ok(Some(value.as_bytes().to_vec())),
                None => Ok(None),
            }
        };

        let html = encode_field(html)?;
        let text = encode_field(text)?;
        let compressed_size = if compress {
            (html.as_ref().map(Vec::len).unwrap_or(0) + text.as_ref().map(Vec::len).unwrap_or(0))
                as i64
        } else {
            original_size
        };

        Ok(EncodedBody {
            html,
            text,
            is_compressed: compress,
            original_size,
            compressed_size,
        })
    }

    async fn save_encoded(
        conn: &mut PgConnection,
        draft: &BodyDraft,
        encoded: EncodedBody,
        ttl_days: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO mail_bodies
               (email_id, html, text_body, is_compressed, original_size, compressed_size,
                cached_at, expires_at, ttl_days, attachments_meta)
               VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW() + make_interval(days => $7::int), $7, $8)
               ON CONFLICT (email_id) DO UPDATE SET
                   html = EXCLUDED.html,
                   text_body = EXCLUDED.text_body,
                   is_compressed = EXCLUDED.is_compressed,
                   original_size = EXCLUDED.original_size,
                   compressed_size = EXCLUDED.compressed_size,
                   cached_at = NOW(),
                   expires_at = EXCLUDED.expires_at,
                   ttl_days = EXCLUDED.ttl_days,
                   attachments_meta = EXCLUDED.attachments_meta"#,
        )
        .bind(draft.email_id)
        .bind(&encoded.html)
        .bind(&encoded.text)
        .bind(encoded.is_compressed)
        .bind(encoded.original_size)
        .bind(encoded.compressed_size)
        .bind(ttl_days as i32)
        .bind(&draft.attachments_meta)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Save a batch on the caller's transaction.
    pub async fn bulk_save(
        &self,
        conn: &mut PgConnection,
        drafts: &[BodyDraft],
    ) -> Result<(), sqlx::Error> {
        for draft in drafts {
            let encoded = self
                .encode(draft.html.as_deref(), draft.text.as_deref())
                .map_err(|err| sqlx::Error::Encode(Box::new(err)))?;
            Self::save_encoded(conn, draft, encoded, self.config.ttl_days).await?;
        }
        Ok(())
    }

    pub async fn save(&self, draft: &BodyDraft) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.bulk_save(&mut conn, std::slice::from_ref(draft)).await
    }

    pub async fn get(&self, email_id: i64) -> Result<Option<MailBody>, sqlx::Error> {
        let row: Option<StoredBody> =
            sqlx::query_as("SELECT * FROM mail_bodies WHERE email_id = $1")
                .bind(email_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(StoredBody::into_body).transpose()
    }

    pub async fn bulk_get(&self, email_ids: &[i64]) -> Result<Vec<MailBody>, sqlx::Error> {
        let rows: Vec<StoredBody> =
            sqlx::query_as("SELECT * FROM mail_bodies WHERE email_id = ANY($1) ORDER BY email_id")
                .bind(email_ids)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(StoredBody::into_body).collect()
    }

    /// Reap bodies past their TTL. Metadata rows in `mails` are untouched;
    /// an expired body can be refetched from the provider on demand.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM mail_bodies WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            log::info!("body store: expired {} cached bodies", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    pub async fn compression_stats(&self) -> Result<CompressionStats, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT COUNT(*) AS bodies,
                      COUNT(*) FILTER (WHERE is_compressed) AS compressed,
                      COALESCE(SUM(original_size), 0)::bigint AS total_original,
                      COALESCE(SUM(compressed_size), 0)::bigint AS total_compressed
               FROM mail_bodies"#,
        )
        .fetch_one(&self.pool)
        .await
    }
}

/// Row as stored: possibly-compressed byte columns.
#[derive(sqlx::FromRow)]
struct StoredBody {
    email_id: i64,
    html: Option<Vec<u8>>,
    text_body: Option<Vec<u8>>,
    is_compressed: bool,
    original_size: i64,
    compressed_size: i64,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    ttl_days: i32,
    attachments_meta: Value,
}

impl StoredBody {
    fn into_body(self) -> Result<MailBody, sqlx::Error> {
        let decode = |field: Option<Vec<u8>>, compressed: bool| -> Result<Option<String>, sqlx::Error> {
            match field {
                Some(bytes) if compressed => {
                    let raw = gunzip(&bytes).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
                    String::from_utf8(raw)
                        .map(Some)
                        .map_err(|err| sqlx::Error::Decode(Box::new(err)))
                }
                Some(bytes) => String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|err| sqlx::Error::Decode(Box::new(err))),
                None => Ok(None),
            }
        };

        Ok(MailBody {
            email_id: self.email_id,
            html: decode(self.html, self.is_compressed)?,
            text: decode(self.text_body, self.is_compressed)?,
            is_compressed: self.is_compressed,
            original_size: self.original_size,
            compressed_size: self.compressed_size,
            cached_at: self.cached_at,
            expires_at: self.expires_at,
            ttl_days: self.ttl_days,
            attachments_meta: self.attachments_meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trips() {
        let input = "x".repeat(4096);
        let compressed = gzip(input.as_bytes()).expect("gzip");
        assert!(compressed.len() < input.len());
        let restored = gunzip(&compressed).expect("gunzip");
        assert_eq!(restored, input.as_bytes());
    }

    fn encoder() -> MailBodyRepository {
        // encode() never touches the pool; a lazy handle is enough.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").expect("lazy pool");
        MailBodyRepository::new(
            pool,
            BodyStoreConfig {
                gzip_threshold: 1024,
                ttl_days: 30,
            },
        )
    }

    #[tokio::test]
    async fn body_at_threshold_is_not_compressed() {
        let repo = encoder();
        let body = "a".repeat(1024);
        let encoded = repo.encode(None, Some(&body)).expect("encode");
        assert!(!encoded.is_compressed);
        assert_eq!(encoded.original_size, 1024);
        assert_eq!(encoded.compressed_size, 1024);
    }

    #[tokio::test]
    async fn body_above_threshold_is_compressed() {
        let repo = encoder();
        let body = "a".repeat(1025);
        let encoded = repo.encode(None, Some(&body)).expect("encode");
        assert!(encoded.is_compressed);
        assert_eq!(encoded.original_size, 1025);
        assert!(encoded.compressed_size < 1025);
    }

    #[tokio::test]
    async fn html_and_text_sizes_combine_for_threshold() {
        let repo = encoder();
        let half = "a".repeat(513);
        let encoded = repo.encode(Some(&half), Some(&half)).expect("encode");
        assert!(encoded.is_compressed);
        assert_eq!(encoded.original_size, 1026);
    }
}
