use crate::bus::payload::{EmailOpJob, JobPayload, MailSaveJob, MailSyncJob, SyncReason};
use crate::bus::{Bus, topics};
use crate::config::SyncConfig;
use crate::error::{OAuthError, ProviderError, SyncError};
use crate::models::{Connection, ProviderKind, SyncState, SyncStatus, VersionSource};
use crate::oauth::OAuthService;
use crate::provider::{
    HistoryChange, PageRequest, ProviderClient, ProviderRegistry, RemoteMessage,
};
use crate::realtime::{Broadcaster, events};
use crate::repo::{
    BodyDraft, ConnectionRepository, EmailRepository, MailBodyRepository, MailDraft,
    ModifierRepository, SyncStateRepository, UpsertedMail,
};
use crate::sync::backoff::backoff_delay;
use crate::webhook::WebhookManager;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Namespaces the advisory lock keys so they cannot collide with other
/// advisory-lock users of the same database.
const SYNC_LOCK_SPACE: i64 = 0x6d61_696c; // "mail"

fn lock_key(connection_id: i64) -> i64 {
    (SYNC_LOCK_SPACE << 32) | (connection_id & 0xffff_ffff)
}

pub struct SyncEngine {
    pool: PgPool,
    connections: ConnectionRepository,
    emails: EmailRepository,
    bodies: MailBodyRepository,
    states: SyncStateRepository,
    modifiers: ModifierRepository,
    oauth: Arc<OAuthService>,
    providers: ProviderRegistry,
    webhooks: Arc<WebhookManager>,
    bus: Bus,
    realtime: Arc<Broadcaster>,
    config: SyncConfig,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        connections: ConnectionRepository,
        emails: EmailRepository,
        bodies: MailBodyRepository,
        states: SyncStateRepository,
        modifiers: ModifierRepository,
        oauth: Arc<OAuthService>,
        providers: ProviderRegistry,
        webhooks: Arc<WebhookManager>,
        bus: Bus,
        realtime: Arc<Broadcaster>,
        config: SyncConfig,
    ) -> Self {
        Self {
            pool,
            connections,
            emails,
            bodies,
            states,
            modifiers,
            oauth,
            providers,
            webhooks,
            bus,
            realtime,
            config,
        }
    }

    /// Start the initial backfill for a connection. Rejects when one is
    /// already running.
    pub async fn initial_sync(&self, user_id: uuid::Uuid, connection_id: i64) -> Result<(), SyncError> {
        let connection = self
            .connections
            .get(connection_id)
            .await?
            .ok_or(SyncError::UnknownConnection(connection_id))?;
        if !connection.is_connected {
            return Err(SyncError::Disconnected(connection_id));
        }

        self.states.ensure(connection_id).await?;
        if !self.states.try_begin_backfill(connection_id).await? {
            return Err(SyncError::AlreadyBackfilling(connection_id));
        }

        let job = MailSyncJob {
            user_id,
            connection_id,
            reason: SyncReason::Manual,
            cursor_hint: None,
        };
        self.bus
            .publish(topics::MAIL_SYNC, &JobPayload::MailSync(job).encode())
            .await?;

        Ok(())
    }

    /// Equivalent to publishing a `mail.sync` job for the connection.
    pub async fn incremental_sync(&self, connection_id: i64) -> Result<(), SyncError> {
        let connection = self
            .connections
            .get(connection_id)
            .await?
            .ok_or(SyncError::UnknownConnection(connection_id))?;

        let job = MailSyncJob {
            user_id: connection.user_id,
            connection_id,
            reason: SyncReason::Manual,
            cursor_hint: None,
        };
        self.bus
            .publish(topics::MAIL_SYNC, &JobPayload::MailSync(job).encode())
            .await?;

        Ok(())
    }

    /// Entry point for a delivered `mail.sync` job. Transient failures are
    /// converted into scheduled retries here; only errors that want bus
    /// redelivery (lock contention, infrastructure) propagate.
    pub async fn run_sync(&self, job: &MailSyncJob) -> Result<(), SyncError> {
        let connection = self
            .connections
            .get(job.connection_id)
            .await?
            .ok_or(SyncError::UnknownConnection(job.connection_id))?;
        if !connection.is_connected {
            log::info!("sync: connection {} disconnected, skipping", connection.id);
            return Ok(());
        }

        // Per-connection single-writer: one step at a time across processes.
        let mut lock_conn = self.pool.acquire().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(lock_key(connection.id))
            .fetch_one(&mut *lock_conn)
            .await?;
        if !locked {
            return Err(SyncError::Busy(connection.id));
        }

        let result = self.run_locked(&connection, job).await;

        let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_key(connection.id))
            .execute(&mut *lock_conn)
            .await;
        drop(lock_conn);

        match result {
            Ok(()) => Ok(()),
            Err(err) => self.handle_step_failure(&connection, err).await,
        }
    }

    async fn run_locked(
        &self,
        connection: &Connection,
        job: &MailSyncJob,
    ) -> Result<(), SyncError> {
        let state = self.states.ensure(connection.id).await?;
        if state.status == SyncStatus::Error && job.reason != SyncReason::Manual {
            log::warn!(
                "sync: connection {} is in terminal error state, ignoring {:?} trigger",
                connection.id,
                job.reason
            );
            return Ok(());
        }

        let token = self.oauth.get_token(connection.id).await?;
        let client = self.providers.client(connection.provider);
        let started = Instant::now();

        // Backfill when the first sync never finished, or when one was
        // explicitly requested (initial_sync flips the status) or left
        // half-done by a crash; the checkpoint makes re-entry cheap.
        if state.first_sync_completed_at.is_none() || state.status == SyncStatus::Backfilling {
            self.states
                .set_status(connection.id, SyncStatus::Backfilling)
                .await?;
            let synced = self
                .page_walk(connection, &state, &token, &client, None, true)
                .await?;
            self.finish_backfill(connection, &token, &client, synced)
                .await?;
            self.states
                .record_sync_success(connection.id, started.elapsed().as_millis() as i64, 0)
                .await?;
        } else {
            self.states
                .set_status(connection.id, SyncStatus::Incremental)
                .await?;
            let applied = self
                .run_incremental(connection, &state, &token, &client)
                .await?;
            self.states
                .record_sync_success(
                    connection.id,
                    started.elapsed().as_millis() as i64,
                    applied,
                )
                .await?;
        }

        log::info!(
            "sync: connection {} step complete ({:?}, {} ms)",
            connection.id,
            job.reason,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Classify a failed step: transient errors schedule a retry (and ack the
    /// job; the retry scheduler republishes), credential errors disconnect,
    /// lock/infrastructure errors bubble up for bus redelivery.
    async fn handle_step_failure(
        &self,
        connection: &Connection,
        err: SyncError,
    ) -> Result<(), SyncError> {
        match &err {
            SyncError::Busy(_) | SyncError::Database(_) | SyncError::Bus(_) => Err(err),
            SyncError::OAuth(OAuthError::InvalidGrant(_))
            | SyncError::Provider(ProviderError::Unauthorized(_)) => {
                self.disconnect_with_notice(connection, &err.to_string())
                    .await?;
                Ok(())
            }
            other if other.is_retryable() => {
                let state = self.states.ensure(connection.id).await?;
                let delay = backoff_delay(
                    self.config.backoff_base,
                    self.config.backoff_cap,
                    state.retry_count as u32,
                );
                let status = self
                    .states
                    .schedule_retry(connection.id, Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(), &other.to_string())
                    .await?;

                if status == SyncStatus::Error {
                    log::error!(
                        "sync: connection {} exhausted retries: {}",
                        connection.id,
                        other
                    );
                    self.realtime.broadcast(
                        connection.user_id,
                        events::SYNC_FAILED,
                        json!({ "connection_id": connection.id, "error": other.to_string() }),
                    );
                } else {
                    log::warn!(
                        "sync: connection {} transient failure, retrying in {:?}: {}",
                        connection.id,
                        delay,
                        other
                    );
                }
                Ok(())
            }
            _ => {
                log::error!("sync: connection {} failed: {}", connection.id, err);
                self.states
                    .mark_failed(connection.id, &err.to_string())
                    .await?;
                self.realtime.broadcast(
                    connection.user_id,
                    events::SYNC_FAILED,
                    json!({ "connection_id": connection.id, "error": err.to_string() }),
                );
                Ok(())
            }
        }
    }

    async fn disconnect_with_notice(
        &self,
        connection: &Connection,
        error: &str,
    ) -> Result<(), SyncError> {
        log::warn!(
            "sync: credentials invalid for connection {}, disconnecting",
            connection.id
        );
        self.connections.mark_disconnected(connection.id).await?;
        if let Err(err) = self.webhooks.disable_for_connection(connection.id).await {
            log::warn!(
                "sync: failed to disable webhook for connection {}: {}",
                connection.id,
                err
            );
        }
        self.states.mark_failed(connection.id, error).await?;
        self.realtime.broadcast(
            connection.user_id,
            events::CONNECTION_STATUS,
            json!({ "connection_id": connection.id, "is_connected": false, "error": error }),
        );
        Ok(())
    }

    /// Checkpointed page walk over the provider listing. Used for the initial
    /// backfill and, with a bounded `query`, for the cursor-invalidation
    /// fallback. Returns how many messages were stored this run.
    async fn page_walk(
        &self,
        connection: &Connection,
        state: &SyncState,
        token: &str,
        client: &ProviderClient,
        query: Option<String>,
        resume_checkpoint: bool,
    ) -> Result<i64, SyncError> {
        let mut page_token = if resume_checkpoint {
            state.checkpoint_page_token.clone()
        } else {
            None
        };
        let mut synced = if resume_checkpoint {
            state.checkpoint_synced_count
        } else {
            0
        };
        let mut total = state.checkpoint_total_count;

        if page_token.is_some() {
            log::info!(
                "sync: connection {} resuming backfill from checkpoint ({} synced)",
                connection.id,
                synced
            );
        }

        loop {
            let page = client
                .list_messages(
                    token,
                    &PageRequest {
                        page_token: page_token.clone(),
                        page_size: self.config.backfill_page_size,
                        query: query.clone(),
                    },
                )
                .await?;

            if let Some(estimate) = page.total_estimate {
                total = estimate as i64;
            }

            let messages = client
                .fetch_messages(token, &page.messages, self.config.fetch_parallelism)
                .await?;
            synced += messages.len() as i64;

            let stored = self
                .store_batch(
                    connection,
                    &messages,
                    Some((page.next_page_token.as_deref(), synced, total)),
                )
                .await?;
            self.enqueue_derived(&stored).await?;

            self.realtime.broadcast(
                connection.user_id,
                events::SYNC_PROGRESS,
                json!({
                    "connection_id": connection.id,
                    "synced": synced,
                    "total": total,
                }),
            );

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(synced)
    }

    async fn finish_backfill(
        &self,
        connection: &Connection,
        token: &str,
        client: &ProviderClient,
        synced: i64,
    ) -> Result<(), SyncError> {
        self.states
            .mark_first_sync_complete(connection.id, synced)
            .await?;

        self.record_current_cursor(connection, token, client).await?;

        // A failed watch subscription degrades to gap-scan polling; it is not
        // worth failing the completed backfill over.
        if let Err(err) = self.webhooks.setup(connection.id).await {
            log::warn!(
                "sync: watch subscription failed for connection {} (gap scan will cover): {}",
                connection.id,
                err
            );
        }

        self.realtime.broadcast(
            connection.user_id,
            events::SYNC_COMPLETED,
            json!({ "connection_id": connection.id, "synced": synced }),
        );

        log::info!(
            "sync: connection {} backfill complete, {} messages",
            connection.id,
            synced
        );
        Ok(())
    }

    /// Record where the change stream currently stands so incremental sync
    /// starts from "now".
    async fn record_current_cursor(
        &self,
        connection: &Connection,
        token: &str,
        client: &ProviderClient,
    ) -> Result<(), SyncError> {
        let cursor = match client.get_profile(token).await?.history_cursor {
            Some(cursor) => Some(cursor),
            // Delta-based providers bootstrap the cursor from an empty round.
            None => client.history(token, "", None).await?.latest_cursor,
        };

        if let Some(cursor) = cursor {
            self.states
                .update_history_cursor_if_greater(connection.id, &cursor)
                .await?;
        }
        Ok(())
    }

    async fn run_incremental(
        &self,
        connection: &Connection,
        state: &SyncState,
        token: &str,
        client: &ProviderClient,
    ) -> Result<i64, SyncError> {
        let Some(cursor) = state.history_cursor.clone() else {
            // Completed backfill without a cursor (for example a failed
            // bootstrap): establish one now, changes arrive next step.
            self.record_current_cursor(connection, token, client).await?;
            return Ok(0);
        };

        let mut page_token: Option<String> = None;
        let mut latest_cursor: Option<String> = None;
        let mut applied: i64 = 0;

        loop {
            let page = match client.history(token, &cursor, page_token.as_deref()).await {
                Ok(page) => page,
                Err(ProviderError::CursorInvalid) => {
                    log::warn!(
                        "sync: history cursor invalid for connection {}, falling back to bounded backfill",
                        connection.id
                    );
                    return self.bounded_fallback(connection, state, token, client).await;
                }
                Err(err) => return Err(err.into()),
            };

            if page.latest_cursor.is_some() {
                latest_cursor = page.latest_cursor.clone();
            }

            for change in &page.changes {
                self.apply_change(connection, token, client, change).await?;
                applied += 1;
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        // Cursor discipline: only moves after every change in the step (and
        // its derived work) persisted. Re-running a half-applied step is safe;
        // upserts converge.
        if let Some(cursor) = latest_cursor {
            self.states
                .update_history_cursor_if_greater(connection.id, &cursor)
                .await?;
        }

        if applied > 0 {
            log::info!(
                "sync: connection {} applied {} incremental changes",
                connection.id,
                applied
            );
        }
        Ok(applied)
    }

    /// History no longer reaches back to our cursor: re-walk a bounded recent
    /// window instead of a full backfill, then re-anchor the cursor.
    async fn bounded_fallback(
        &self,
        connection: &Connection,
        state: &SyncState,
        token: &str,
        client: &ProviderClient,
    ) -> Result<i64, SyncError> {
        let days = self.config.fallback_window_days.max(1);
        let query = client.recent_window_query(days);

        self.states
            .set_status(connection.id, SyncStatus::Backfilling)
            .await?;
        let synced = self
            .page_walk(connection, state, token, client, query, false)
            .await?;
        self.states.clear_checkpoint(connection.id).await?;
        self.record_current_cursor(connection, token, client).await?;

        log::info!(
            "sync: connection {} recovered via {}-day window ({} messages)",
            connection.id,
            days,
            synced
        );
        Ok(synced)
    }

    async fn apply_change(
        &self,
        connection: &Connection,
        token: &str,
        client: &ProviderClient,
        change: &HistoryChange,
    ) -> Result<(), SyncError> {
        match change {
            HistoryChange::Added { external_id } => {
                self.mirror_added(connection, token, client, external_id)
                    .await?;
            }
            HistoryChange::LabelsChanged {
                external_id,
                added,
                removed,
            } => {
                let Some(mail) = self
                    .emails
                    .get_by_external_id(connection.id, external_id)
                    .await?
                else {
                    // A label change for a message we never mirrored; treat it
                    // as an add so the mirror converges.
                    return self
                        .mirror_added(connection, token, client, external_id)
                        .await;
                };

                let mut labels = mail.labels.clone();
                labels.retain(|label| !removed.contains(label));
                for label in added {
                    if !labels.contains(label) {
                        labels.push(label.clone());
                    }
                }

                let (is_read, folder) =
                    derive_read_folder(connection.provider, &labels, mail.is_read, &mail.folder);
                self.emails
                    .update_labels_state(mail.id, &labels, is_read, &folder)
                    .await?;
                self.modifiers
                    .bump_version(mail.id, crate::models::ModifierType::AddLabel, VersionSource::Provider)
                    .await?;

                self.realtime.broadcast(
                    connection.user_id,
                    events::MAIL_UPDATED,
                    json!({ "email_id": mail.id, "labels": labels, "is_read": is_read }),
                );
            }
            HistoryChange::Deleted { external_id } => {
                if let Some(mail) = self
                    .emails
                    .get_by_external_id(connection.id, external_id)
                    .await?
                {
                    self.emails
                        .delete_by_external_id(connection.id, external_id)
                        .await?;
                    self.realtime.broadcast(
                        connection.user_id,
                        events::MAIL_DELETED,
                        json!({ "email_id": mail.id, "connection_id": connection.id }),
                    );
                }
            }
        }
        Ok(())
    }

    async fn mirror_added(
        &self,
        connection: &Connection,
        token: &str,
        client: &ProviderClient,
        external_id: &str,
    ) -> Result<(), SyncError> {
        let message = client.get_message(token, external_id).await?;
        let stored = self
            .store_batch(connection, std::slice::from_ref(&message), None)
            .await?;
        self.enqueue_derived(&stored).await?;

        if let Some(mail) = stored.first() {
            self.realtime.broadcast(
                connection.user_id,
                events::MAIL_RECEIVED,
                json!({
                    "email_id": mail.id,
                    "connection_id": connection.id,
                    "subject": message.subject,
                }),
            );
        }
        Ok(())
    }

    /// Persist a batch of messages: metadata upserts, attachment sets, bodies
    /// and (for backfill) the covering checkpoint, all on one transaction.
    async fn store_batch(
        &self,
        connection: &Connection,
        messages: &[RemoteMessage],
        checkpoint: Option<(Option<&str>, i64, i64)>,
    ) -> Result<Vec<UpsertedMail>, SyncError> {
        if messages.is_empty() {
            if let Some((page_token, synced, total)) = checkpoint {
                let mut tx = self.pool.begin().await?;
                SyncStateRepository::save_checkpoint(
                    &mut tx,
                    connection.id,
                    page_token,
                    synced,
                    total,
                )
                .await?;
                tx.commit().await?;
            }
            return Ok(Vec::new());
        }

        let drafts: Vec<MailDraft> = messages
            .iter()
            .map(|remote| MailDraft::from_remote(connection.user_id, connection.id, remote))
            .collect();

        let mut tx = self.pool.begin().await?;
        let stored = EmailRepository::bulk_upsert(&mut tx, &drafts).await?;

        let by_external: HashMap<&str, &RemoteMessage> = messages
            .iter()
            .map(|message| (message.external_id.as_str(), message))
            .collect();

        let mut body_drafts = Vec::with_capacity(stored.len());
        for upserted in &stored {
            let Some(remote) = by_external.get(upserted.external_id.as_str()) else {
                continue;
            };
            EmailRepository::replace_attachments(&mut tx, upserted.id, &remote.attachments)
                .await?;
            body_drafts.push(BodyDraft {
                email_id: upserted.id,
                html: remote.html.clone(),
                text: remote.text.clone(),
                attachments_meta: json!(remote
                    .attachments
                    .iter()
                    .map(|a| json!({ "filename": a.filename, "mime_type": a.mime_type, "size": a.size }))
                    .collect::<Vec<_>>()),
            });
        }
        self.bodies.bulk_save(&mut tx, &body_drafts).await?;

        if let Some((page_token, synced, total)) = checkpoint {
            SyncStateRepository::save_checkpoint(&mut tx, connection.id, page_token, synced, total)
                .await?;
        }

        tx.commit().await?;
        Ok(stored)
    }

    /// Fan out derived work for newly mirrored mails. The jobs are idempotent
    /// on `(email_id, op)`; re-upserted mails enqueue nothing.
    async fn enqueue_derived(&self, stored: &[UpsertedMail]) -> Result<(), SyncError> {
        for mail in stored.iter().filter(|m| m.inserted) {
            let classify = EmailOpJob {
                email_id: mail.id,
                op: "classify".to_string(),
            };
            let index = EmailOpJob {
                email_id: mail.id,
                op: "index".to_string(),
            };
            self.bus
                .publish(topics::AI_CLASSIFY, &JobPayload::AiClassify(classify).encode())
                .await?;
            self.bus
                .publish(topics::RAG_INDEX, &JobPayload::RagIndex(index).encode())
                .await?;
        }
        Ok(())
    }

    /// Fetch and mirror a single message (`mail.save` jobs).
    pub async fn save_single(&self, job: &MailSaveJob) -> Result<(), SyncError> {
        let connection = self
            .connections
            .get(job.connection_id)
            .await?
            .ok_or(SyncError::UnknownConnection(job.connection_id))?;
        let token = self.oauth.get_token(connection.id).await?;
        let client = self.providers.client(connection.provider);

        let message = client.get_message(&token, &job.external_id).await?;
        let stored = self
            .store_batch(&connection, std::slice::from_ref(&message), None)
            .await?;
        self.enqueue_derived(&stored).await?;
        Ok(())
    }
}

/// Read/folder state implied by a label set. Gmail encodes both in labels;
/// other providers keep the mirrored values.
fn derive_read_folder(
    provider: ProviderKind,
    labels: &[String],
    current_is_read: bool,
    current_folder: &str,
) -> (bool, String) {
    if provider != ProviderKind::Gmail {
        return (current_is_read, current_folder.to_string());
    }

    let has = |label: &str| labels.iter().any(|l| l == label);
    let folder = if has("TRASH") {
        "trash"
    } else if has("SPAM") {
        "spam"
    } else if has("SENT") {
        "sent"
    } else if has("INBOX") {
        "inbox"
    } else {
        "archive"
    };

    (!has("UNREAD"), folder.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_distinct_per_connection() {
        assert_ne!(lock_key(1), lock_key(2));
        assert_ne!(lock_key(1), 1);
    }

    #[test]
    fn gmail_labels_drive_read_and_folder() {
        let labels = vec!["INBOX".to_string(), "UNREAD".to_string()];
        let (is_read, folder) =
            derive_read_folder(ProviderKind::Gmail, &labels, true, "archive");
        assert!(!is_read);
        assert_eq!(folder, "inbox");

        let labels = vec!["TRASH".to_string()];
        let (is_read, folder) = derive_read_folder(ProviderKind::Gmail, &labels, false, "inbox");
        assert!(is_read);
        assert_eq!(folder, "trash");
    }

    #[test]
    fn outlook_keeps_mirrored_state() {
        let labels = vec!["Projects".to_string()];
        let (is_read, folder) =
            derive_read_folder(ProviderKind::Outlook, &labels, true, "inbox");
        assert!(is_read);
        assert_eq!(folder, "inbox");
    }
}
