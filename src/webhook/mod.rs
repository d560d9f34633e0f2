//! Webhook lifecycle manager.
//!
//! Owns at most one push channel per `(connection, resource_type)`:
//! subscribes after backfill, renews channels approaching expiry, counts
//! provider rejections up to a failure threshold, and translates inbound
//! push notifications into `mail.sync` jobs.
//!
//! Gmail pushes arrive as Pub/Sub envelopes carrying `{emailAddress,
//! historyId}`; Graph pushes carry the subscription id plus a per-connection
//! `clientState` secret that must match before anything is enqueued.

use crate::bus::payload::{JobPayload, MailSyncJob, SyncReason};
use crate::bus::{Bus, topics};
use crate::config::WebhookConfig;
use crate::error::{OAuthError, WebhookError};
use crate::models::{
    Connection, ProviderKind, WEBHOOK_RESOURCE_MAIL, Webhook, WebhookStatus,
};
use crate::oauth::OAuthService;
use crate::provider::{ProviderRegistry, WatchRequest};
use crate::realtime::{Broadcaster, events};
use crate::repo::{
    ConnectionRepository, NewWebhook, SyncStateRepository, WebhookRepository,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Pub/Sub push envelope wrapping a Gmail notification.
#[derive(Debug, Deserialize)]
struct PubSubEnvelope {
    message: PubSubMessage,
    #[allow(dead_code)]
    subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
    /// Base64 of `{"emailAddress": ..., "historyId": ...}`.
    data: String,
}

#[derive(Debug, Deserialize)]
struct GmailNotification {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: Value,
}

#[derive(Debug, Deserialize)]
struct GraphNotificationBatch {
    #[serde(default)]
    value: Vec<GraphNotification>,
}

#[derive(Debug, Deserialize)]
struct GraphNotification {
    #[serde(rename = "subscriptionId")]
    subscription_id: String,
    #[serde(rename = "clientState")]
    client_state: Option<String>,
}

pub struct WebhookManager {
    webhooks: WebhookRepository,
    connections: ConnectionRepository,
    states: SyncStateRepository,
    oauth: Arc<OAuthService>,
    providers: ProviderRegistry,
    bus: Bus,
    realtime: Arc<Broadcaster>,
    config: WebhookConfig,
}

impl WebhookManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        webhooks: WebhookRepository,
        connections: ConnectionRepository,
        states: SyncStateRepository,
        oauth: Arc<OAuthService>,
        providers: ProviderRegistry,
        bus: Bus,
        realtime: Arc<Broadcaster>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            webhooks,
            connections,
            states,
            oauth,
            providers,
            bus,
            realtime,
            config,
        }
    }

    /// Per-connection shared secret echoed back by Graph notifications.
    fn client_state(&self, connection_id: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.config.verification_token.as_bytes());
        hasher.update(connection_id.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Create (or replace) the push channel for a connection. Called from the
    /// OAuth-completion hook, backfill completion and startup reconciliation.
    pub async fn setup(&self, connection_id: i64) -> Result<Webhook, WebhookError> {
        let connection = self
            .connections
            .get(connection_id)
            .await?
            .ok_or_else(|| WebhookError::UnknownSubscription(connection_id.to_string()))?;

        let token = match self.oauth.get_token(connection_id).await {
            Ok(token) => token,
            Err(OAuthError::InvalidGrant(_)) => {
                self.handle_invalid_credentials(&connection).await?;
                return Err(WebhookError::OAuth(OAuthError::InvalidGrant(connection_id)));
            }
            Err(err) => return Err(err.into()),
        };

        let client = self.providers.client(connection.provider);
        let request = WatchRequest {
            callback_url: self.config.callback_url.clone(),
            pubsub_topic: self.config.gmail_pubsub_topic.clone(),
            client_state: self.client_state(connection_id),
        };

        let subscription = client.watch_subscribe(&token, &request).await?;

        let webhook = self
            .webhooks
            .upsert(&NewWebhook {
                connection_id,
                provider: connection.provider,
                resource_type: WEBHOOK_RESOURCE_MAIL.to_string(),
                subscription_id: subscription.subscription_id.clone(),
                resource_id: subscription.resource_id.clone(),
                channel_id: None,
                expires_at: subscription.expires_at,
            })
            .await?;

        self.states
            .set_watch(
                connection_id,
                subscription.expires_at,
                subscription.resource_id.as_deref(),
            )
            .await?;
        if let Some(cursor) = &subscription.initial_cursor {
            self.states
                .update_history_cursor_if_greater(connection_id, cursor)
                .await?;
        }

        log::info!(
            "webhook: channel active for connection {} (expires {})",
            connection_id,
            subscription.expires_at
        );
        Ok(webhook)
    }

    /// Renew every active channel expiring within `lead_time`.
    pub async fn renew_expiring(&self) -> Result<usize, WebhookError> {
        let lead = chrono::Duration::from_std(self.config.lead_time).unwrap_or_default();
        let expiring = self.webhooks.list_expiring(Utc::now() + lead).await?;
        let mut renewed = 0;

        for webhook in expiring {
            match self.renew_one(&webhook).await {
                Ok(()) => renewed += 1,
                Err(err) => {
                    log::warn!(
                        "webhook: renewal failed for connection {}: {}",
                        webhook.connection_id,
                        err
                    );
                    // Space out consecutive failing renewals; the provider is
                    // likely rejecting us for a reason.
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }

        Ok(renewed)
    }

    async fn renew_one(&self, webhook: &Webhook) -> Result<(), WebhookError> {
        let connection = self
            .connections
            .get(webhook.connection_id)
            .await?
            .ok_or_else(|| WebhookError::UnknownSubscription(webhook.subscription_id.clone()))?;

        let token = match self.oauth.get_token(connection.id).await {
            Ok(token) => token,
            Err(OAuthError::InvalidGrant(_)) => {
                self.handle_invalid_credentials(&connection).await?;
                return Err(WebhookError::OAuth(OAuthError::InvalidGrant(connection.id)));
            }
            Err(err) => return Err(err.into()),
        };

        let client = self.providers.client(connection.provider);
        let request = WatchRequest {
            callback_url: self.config.callback_url.clone(),
            pubsub_topic: self.config.gmail_pubsub_topic.clone(),
            client_state: self.client_state(connection.id),
        };

        match client
            .watch_renew(&token, &webhook.subscription_id, &request)
            .await
        {
            Ok(subscription) => {
                self.webhooks
                    .update_expiration(webhook.id, subscription.expires_at)
                    .await?;
                self.states
                    .set_watch(
                        connection.id,
                        subscription.expires_at,
                        subscription.resource_id.as_deref(),
                    )
                    .await?;
                log::info!(
                    "webhook: renewed channel for connection {} until {}",
                    connection.id,
                    subscription.expires_at
                );
                Ok(())
            }
            Err(err) => {
                let failures = self
                    .webhooks
                    .increment_failure_count(webhook.id, &err.to_string())
                    .await?;

                if failures >= self.config.max_failures as i32 {
                    log::warn!(
                        "webhook: channel for connection {} failed {} times, re-creating",
                        connection.id,
                        failures
                    );
                    self.webhooks
                        .update_status(webhook.id, WebhookStatus::Failed, Some(&err.to_string()))
                        .await?;
                    // Fresh setup with freshly acquired credentials.
                    self.setup(connection.id).await?;
                }
                Err(err.into())
            }
        }
    }

    async fn handle_invalid_credentials(
        &self,
        connection: &Connection,
    ) -> Result<(), WebhookError> {
        self.connections.mark_disconnected(connection.id).await?;
        self.webhooks
            .disable_for_connection(connection.id)
            .await?;
        self.realtime.broadcast(
            connection.user_id,
            events::CONNECTION_STATUS,
            json!({
                "connection_id": connection.id,
                "is_connected": false,
                "error": "credentials expired",
            }),
        );
        Ok(())
    }

    pub async fn disable_for_connection(&self, connection_id: i64) -> Result<(), WebhookError> {
        self.webhooks.disable_for_connection(connection_id).await?;
        Ok(())
    }

    /// Authenticate an inbound push, resolve its connection and enqueue the
    /// incremental sync step.
    pub async fn on_provider_push(
        &self,
        provider: ProviderKind,
        payload: &Value,
        headers: &HashMap<String, String>,
    ) -> Result<(), WebhookError> {
        match provider {
            ProviderKind::Gmail => self.on_gmail_push(payload, headers).await,
            ProviderKind::Outlook => self.on_graph_push(payload).await,
        }
    }

    async fn on_gmail_push(
        &self,
        payload: &Value,
        headers: &HashMap<String, String>,
    ) -> Result<(), WebhookError> {
        if !self.config.verification_token.is_empty() {
            let presented = headers
                .get("x-goog-channel-token")
                .or_else(|| headers.get("x-verification-token"));
            if presented.is_some_and(|t| t != &self.config.verification_token) {
                return Err(WebhookError::BadSignature(
                    "verification token mismatch".to_string(),
                ));
            }
        }

        let envelope: PubSubEnvelope = serde_json::from_value(payload.clone())
            .map_err(|err| WebhookError::BadPayload(err.to_string()))?;
        let data = STANDARD
            .decode(&envelope.message.data)
            .map_err(|err| WebhookError::BadPayload(err.to_string()))?;
        let notification: GmailNotification = serde_json::from_slice(&data)
            .map_err(|err| WebhookError::BadPayload(err.to_string()))?;

        let connection = self
            .connections
            .find_by_email(ProviderKind::Gmail, &notification.email_address)
            .await?
            .ok_or_else(|| {
                WebhookError::UnknownSubscription(notification.email_address.clone())
            })?;

        let cursor_hint = match &notification.history_id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };

        self.trigger_sync(&connection, cursor_hint).await
    }

    async fn on_graph_push(&self, payload: &Value) -> Result<(), WebhookError> {
        let batch: GraphNotificationBatch = serde_json::from_value(payload.clone())
            .map_err(|err| WebhookError::BadPayload(err.to_string()))?;

        for notification in batch.value {
            let webhook = self
                .webhooks
                .find_by_subscription(&notification.subscription_id)
                .await?
                .ok_or_else(|| {
                    WebhookError::UnknownSubscription(notification.subscription_id.clone())
                })?;

            let expected = self.client_state(webhook.connection_id);
            if notification.client_state.as_deref() != Some(expected.as_str()) {
                return Err(WebhookError::BadSignature(format!(
                    "clientState mismatch for subscription {}",
                    notification.subscription_id
                )));
            }

            let connection = self
                .connections
                .get(webhook.connection_id)
                .await?
                .ok_or_else(|| {
                    WebhookError::UnknownSubscription(notification.subscription_id.clone())
                })?;

            self.trigger_sync(&connection, None).await?;
        }
        Ok(())
    }

    async fn trigger_sync(
        &self,
        connection: &Connection,
        cursor_hint: Option<String>,
    ) -> Result<(), WebhookError> {
        if let Some(webhook) = self
            .webhooks
            .get_by_connection(connection.id, WEBHOOK_RESOURCE_MAIL)
            .await?
        {
            self.webhooks.touch_triggered(webhook.id).await?;
        }

        let job = MailSyncJob {
            user_id: connection.user_id,
            connection_id: connection.id,
            reason: SyncReason::Webhook,
            cursor_hint,
        };
        self.bus
            .publish(topics::MAIL_SYNC, &JobPayload::MailSync(job).encode())
            .await?;

        log::debug!("webhook: push for connection {} enqueued", connection.id);
        Ok(())
    }

    /// Startup reconciliation: make sure every connected account has an
    /// active channel.
    pub async fn reconcile(&self) -> Result<(), WebhookError> {
        for connection in self.connections.list_connected().await? {
            let existing = self
                .webhooks
                .get_by_connection(connection.id, WEBHOOK_RESOURCE_MAIL)
                .await?;

            let needs_setup = match &existing {
                Some(webhook) => {
                    webhook.status != WebhookStatus::Active || webhook.expires_at < Utc::now()
                }
                None => true,
            };

            if needs_setup {
                if let Err(err) = self.setup(connection.id).await {
                    log::warn!(
                        "webhook: reconcile setup failed for connection {}: {}",
                        connection.id,
                        err
                    );
                }
            }
        }
        Ok(())
    }
}
