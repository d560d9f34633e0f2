//! Offline modifier engine.
//!
//! Client mutation intents persist as `pending` rows and are guaranteed
//! eventual application to the provider. A drain processes one connection's
//! queue in submission order; per-email ordering is preserved by skipping
//! everything behind an open conflict on the same email. Version-sensitive
//! mutations conflict instead of applying when the client observed an older
//! `EmailVersion` than the server holds.

use crate::bus::payload::{JobPayload, MailModifyJob, MailSaveJob, MailSendJob};
use crate::bus::{Bus, topics};
use crate::error::{ModifierError, ProviderError};
use crate::models::{
    Connection, ConflictResolution, ConflictType, Modifier, ModifierStatus, ModifierType,
    VersionSource,
};
use crate::oauth::OAuthService;
use crate::provider::{OutgoingMail, ProviderClient, ProviderRegistry, RemoteModify};
use crate::realtime::{Broadcaster, events};
use crate::repo::{ConnectionRepository, EmailRepository, ModifierRepository, NewModifier};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

const MODIFIER_LOCK_SPACE: i64 = 0x6d6f_6469; // "modi"

fn lock_key(connection_id: i64) -> i64 {
    (MODIFIER_LOCK_SPACE << 32) | (connection_id & 0xffff_ffff)
}

/// Free-form modifier parameters, decoded per type.
#[derive(Debug, Default, Deserialize)]
struct ModifierParams {
    label: Option<String>,
    folder: Option<String>,
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    cc: Vec<String>,
    #[serde(default)]
    bcc: Vec<String>,
    subject: Option<String>,
    text: Option<String>,
    html: Option<String>,
    in_reply_to: Option<String>,
    thread_id: Option<String>,
}

enum ApplyOutcome {
    Applied,
    Conflicted,
}

pub struct ModifierEngine {
    pool: PgPool,
    modifiers: ModifierRepository,
    emails: EmailRepository,
    connections: ConnectionRepository,
    oauth: Arc<OAuthService>,
    providers: ProviderRegistry,
    bus: Bus,
    realtime: Arc<Broadcaster>,
    max_retries: u32,
}

impl ModifierEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        modifiers: ModifierRepository,
        emails: EmailRepository,
        connections: ConnectionRepository,
        oauth: Arc<OAuthService>,
        providers: ProviderRegistry,
        bus: Bus,
        realtime: Arc<Broadcaster>,
        max_retries: u32,
    ) -> Self {
        Self {
            pool,
            modifiers,
            emails,
            connections,
            oauth,
            providers,
            bus,
            realtime,
            max_retries,
        }
    }

    /// Persist a mutation intent and enqueue its application. Safe to call
    /// twice with the same id.
    pub async fn submit(&self, new: NewModifier) -> Result<Modifier, ModifierError> {
        let modifier = self.modifiers.create(&new).await?;

        let payload = match modifier.mod_type {
            ModifierType::Send => JobPayload::MailSend(MailSendJob {
                connection_id: modifier.connection_id,
                modifier_id: modifier.id,
            }),
            _ => JobPayload::MailModify(MailModifyJob {
                connection_id: modifier.connection_id,
            }),
        };
        self.bus
            .publish(payload.topic(), &payload.encode())
            .await?;

        Ok(modifier)
    }

    /// Drain pending modifiers for one connection in submission order.
    pub async fn apply_pending(&self, connection_id: i64) -> Result<usize, ModifierError> {
        let mut lock_conn = self.pool.acquire().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(lock_key(connection_id))
            .fetch_one(&mut *lock_conn)
            .await?;
        if !locked {
            return Err(ModifierError::Busy(connection_id));
        }

        let result = self.drain_locked(connection_id).await;

        let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_key(connection_id))
            .execute(&mut *lock_conn)
            .await;

        result
    }

    async fn drain_locked(&self, connection_id: i64) -> Result<usize, ModifierError> {
        let connection = self
            .connections
            .get(connection_id)
            .await?
            .ok_or(ModifierError::Busy(connection_id))?;
        let pending = self.modifiers.get_pending_by_connection(connection_id).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let token = self.oauth.get_token(connection_id).await?;
        let client = self.providers.client(connection.provider);

        // Emails behind an open conflict: later modifiers for the same email
        // must wait for resolution to keep the per-email order.
        let mut blocked: HashSet<i64> = HashSet::new();
        let mut applied = 0;

        for modifier in pending {
            if let Some(email_id) = modifier.email_id {
                if blocked.contains(&email_id) {
                    continue;
                }
            }

            match self.apply_one(&connection, &client, &token, &modifier).await {
                Ok(ApplyOutcome::Applied) => applied += 1,
                Ok(ApplyOutcome::Conflicted) => {
                    if let Some(email_id) = modifier.email_id {
                        blocked.insert(email_id);
                    }
                }
                Err(err) if err.is_retryable() => {
                    let retries = self
                        .modifiers
                        .record_retry(modifier.id, &err.to_string())
                        .await?;
                    if retries >= self.max_retries as i32 {
                        self.modifiers
                            .mark_failed(modifier.id, &err.to_string())
                            .await?;
                        log::error!(
                            "modifier: {} exhausted retries: {}",
                            modifier.id,
                            err
                        );
                        continue;
                    }
                    // Stop the drain; bus redelivery retries the remainder.
                    return Err(err);
                }
                Err(err) => {
                    self.modifiers
                        .mark_failed(modifier.id, &err.to_string())
                        .await?;
                    log::error!("modifier: {} failed permanently: {}", modifier.id, err);
                }
            }
        }

        Ok(applied)
    }

    /// Apply a single modifier by id (`mail.send` jobs target one modifier).
    pub async fn apply_single(&self, modifier_id: Uuid) -> Result<(), ModifierError> {
        let modifier = self
            .modifiers
            .get(modifier_id)
            .await?
            .ok_or(ModifierError::UnknownModifier(modifier_id))?;
        if modifier.status != ModifierStatus::Pending {
            return Ok(());
        }

        let connection = self
            .connections
            .get(modifier.connection_id)
            .await?
            .ok_or(ModifierError::Busy(modifier.connection_id))?;
        let token = self.oauth.get_token(connection.id).await?;
        let client = self.providers.client(connection.provider);

        match self.apply_one(&connection, &client, &token, &modifier).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_retryable() => {
                let retries = self
                    .modifiers
                    .record_retry(modifier.id, &err.to_string())
                    .await?;
                if retries >= self.max_retries as i32 {
                    self.modifiers
                        .mark_failed(modifier.id, &err.to_string())
                        .await?;
                    return Ok(());
                }
                Err(err)
            }
            Err(err) => {
                self.modifiers
                    .mark_failed(modifier.id, &err.to_string())
                    .await?;
                Ok(())
            }
        }
    }

    async fn apply_one(
        &self,
        connection: &Connection,
        client: &ProviderClient,
        token: &str,
        modifier: &Modifier,
    ) -> Result<ApplyOutcome, ModifierError> {
        let server_version = match modifier.email_id {
            Some(email_id) => self.modifiers.get_version(email_id).await?,
            None => 0,
        };

        if modifier.mod_type.is_version_sensitive()
            && modifier.email_id.is_some()
            && modifier.client_version < server_version
        {
            self.record_conflict(connection, modifier, ConflictType::Version, server_version)
                .await?;
            return Ok(ApplyOutcome::Conflicted);
        }

        let params: ModifierParams =
            serde_json::from_value(modifier.params.clone()).unwrap_or_default();

        let apply_result = match modifier.mod_type {
            ModifierType::Send => {
                let outgoing = OutgoingMail {
                    to: params.to.clone(),
                    cc: params.cc.clone(),
                    bcc: params.bcc.clone(),
                    subject: params.subject.clone().unwrap_or_default(),
                    text: params.text.clone(),
                    html: params.html.clone(),
                    in_reply_to: params.in_reply_to.clone(),
                    thread_id: params.thread_id.clone().or_else(|| modifier.thread_id.clone()),
                };
                client.send(token, &outgoing).await.map(Some)
            }
            _ => {
                let external_id = match self.resolve_external_id(connection, modifier).await? {
                    Some(id) => id,
                    None => return Err(ModifierError::MissingTarget(modifier.id)),
                };
                let op = remote_op(modifier.mod_type, &params);
                client.modify(token, &external_id, &op).await.map(|_| None)
            }
        };

        match apply_result {
            Ok(sent_id) => {
                let new_version = match modifier.email_id {
                    Some(email_id) => {
                        let version = self
                            .modifiers
                            .bump_version(email_id, modifier.mod_type, VersionSource::User)
                            .await?;
                        self.apply_local_effect(connection, modifier, &params).await?;
                        version
                    }
                    None => server_version,
                };
                self.modifiers.mark_applied(modifier.id, new_version).await?;

                // Mirror a sent message once the provider reports its id.
                if let Some(Some(external_id)) = sent_id {
                    let save = MailSaveJob {
                        user_id: connection.user_id,
                        connection_id: connection.id,
                        external_id,
                    };
                    self.bus
                        .publish(topics::MAIL_SAVE, &JobPayload::MailSave(save).encode())
                        .await?;
                }

                self.realtime.broadcast(
                    connection.user_id,
                    events::MODIFIER_APPLIED,
                    json!({
                        "modifier_id": modifier.id,
                        "email_id": modifier.email_id,
                        "type": modifier.mod_type,
                        "server_version": new_version,
                    }),
                );
                Ok(ApplyOutcome::Applied)
            }
            Err(ProviderError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                self.record_conflict(connection, modifier, ConflictType::Deleted, server_version)
                    .await?;
                Ok(ApplyOutcome::Conflicted)
            }
            Err(ProviderError::Status { status, .. }) if status == StatusCode::FORBIDDEN => {
                self.record_conflict(
                    connection,
                    modifier,
                    ConflictType::Permission,
                    server_version,
                )
                .await?;
                Ok(ApplyOutcome::Conflicted)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn resolve_external_id(
        &self,
        connection: &Connection,
        modifier: &Modifier,
    ) -> Result<Option<String>, ModifierError> {
        if let Some(external_id) = &modifier.external_id {
            return Ok(Some(external_id.clone()));
        }
        if let Some(email_id) = modifier.email_id {
            return Ok(self
                .emails
                .get(email_id)
                .await?
                .map(|mail| mail.external_id));
        }
        let _ = connection;
        Ok(None)
    }

    async fn record_conflict(
        &self,
        connection: &Connection,
        modifier: &Modifier,
        conflict_type: ConflictType,
        server_version: i64,
    ) -> Result<(), ModifierError> {
        let server_state = match modifier.email_id {
            Some(email_id) => match self.emails.get(email_id).await? {
                Some(mail) => json!({
                    "version": server_version,
                    "is_read": mail.is_read,
                    "folder": mail.folder,
                    "labels": mail.labels,
                }),
                None => json!({ "version": server_version, "deleted": true }),
            },
            None => json!({ "version": server_version }),
        };

        let conflict = self
            .modifiers
            .create_conflict(
                modifier.id,
                conflict_type,
                json!({
                    "version": modifier.client_version,
                    "type": modifier.mod_type,
                    "params": modifier.params,
                }),
                server_state,
            )
            .await?;
        self.modifiers
            .mark_conflict(modifier.id, server_version)
            .await?;

        log::warn!(
            "modifier: {} conflicted ({:?}, client v{} vs server v{})",
            modifier.id,
            conflict_type,
            modifier.client_version,
            server_version
        );
        self.realtime.broadcast(
            connection.user_id,
            events::MODIFIER_CONFLICT,
            json!({
                "modifier_id": modifier.id,
                "conflict_id": conflict.id,
                "email_id": modifier.email_id,
                "type": conflict_type,
            }),
        );
        Ok(())
    }

    /// Mirror the accepted mutation locally so the UI converges without
    /// waiting for the next incremental sync.
    async fn apply_local_effect(
        &self,
        connection: &Connection,
        modifier: &Modifier,
        params: &ModifierParams,
    ) -> Result<(), ModifierError> {
        let Some(email_id) = modifier.email_id else {
            return Ok(());
        };

        match modifier.mod_type {
            ModifierType::MarkRead => self.emails.update_read_status(email_id, true).await?,
            ModifierType::MarkUnread => self.emails.update_read_status(email_id, false).await?,
            ModifierType::Archive => self.emails.update_folder(email_id, "archive").await?,
            ModifierType::Trash => self.emails.update_folder(email_id, "trash").await?,
            ModifierType::Star => self.emails.add_label(email_id, "STARRED").await?,
            ModifierType::Unstar => self.emails.remove_label(email_id, "STARRED").await?,
            ModifierType::AddLabel => {
                if let Some(label) = &params.label {
                    self.emails.add_label(email_id, label).await?;
                }
            }
            ModifierType::RemoveLabel => {
                if let Some(label) = &params.label {
                    self.emails.remove_label(email_id, label).await?;
                }
            }
            ModifierType::Move => {
                if let Some(folder) = &params.folder {
                    self.emails.update_folder(email_id, folder).await?;
                }
            }
            ModifierType::Delete => {
                if let Some(mail) = self.emails.get(email_id).await? {
                    self.emails
                        .delete_by_external_id(connection.id, &mail.external_id)
                        .await?;
                }
            }
            ModifierType::Send => {}
        }
        Ok(())
    }

    /// Re-enter application for a conflicted modifier under the chosen
    /// policy.
    pub async fn resolve_conflict(
        &self,
        modifier_id: Uuid,
        resolution: ConflictResolution,
        resolved_by: Option<Uuid>,
    ) -> Result<(), ModifierError> {
        let modifier = self
            .modifiers
            .get(modifier_id)
            .await?
            .ok_or(ModifierError::UnknownModifier(modifier_id))?;
        if modifier.status != ModifierStatus::Conflict {
            return Err(ModifierError::NotInConflict(modifier_id));
        }

        let conflict = self
            .modifiers
            .get_conflict_by_modifier(modifier_id)
            .await?
            .ok_or(ModifierError::NotInConflict(modifier_id))?;
        self.modifiers
            .resolve_conflict(conflict.id, resolution, resolved_by)
            .await?;

        match resolution {
            ConflictResolution::DiscardLocal => {
                self.modifiers
                    .mark_failed(modifier_id, "discarded by conflict resolution")
                    .await?;
            }
            ConflictResolution::ApplyLocal | ConflictResolution::Merge => {
                // Re-queue at the version the user just reviewed; the version
                // check passes and application proceeds. Merge differs only
                // for label ops, whose application is already additive.
                let current = match modifier.email_id {
                    Some(email_id) => self.modifiers.get_version(email_id).await?,
                    None => 0,
                };
                self.modifiers
                    .requeue_with_version(modifier_id, current)
                    .await?;

                let payload = JobPayload::MailModify(MailModifyJob {
                    connection_id: modifier.connection_id,
                });
                self.bus
                    .publish(payload.topic(), &payload.encode())
                    .await?;
            }
        }

        log::info!(
            "modifier: {} resolved as {:?}",
            modifier_id,
            resolution
        );
        Ok(())
    }
}

fn remote_op(mod_type: ModifierType, params: &ModifierParams) -> RemoteModify {
    match mod_type {
        ModifierType::MarkRead => RemoteModify::MarkRead,
        ModifierType::MarkUnread => RemoteModify::MarkUnread,
        ModifierType::Archive => RemoteModify::Archive,
        ModifierType::Trash => RemoteModify::Trash,
        ModifierType::Delete => RemoteModify::Delete,
        ModifierType::Star => RemoteModify::Star,
        ModifierType::Unstar => RemoteModify::Unstar,
        ModifierType::AddLabel => {
            RemoteModify::AddLabel(params.label.clone().unwrap_or_default())
        }
        ModifierType::RemoveLabel => {
            RemoteModify::RemoveLabel(params.label.clone().unwrap_or_default())
        }
        ModifierType::Move => RemoteModify::Move(params.folder.clone().unwrap_or_default()),
        // Send never reaches the modify path.
        ModifierType::Send => RemoteModify::MarkRead,
    }
}
