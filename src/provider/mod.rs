//! Uniform operations over the mail providers.
//!
//! Gmail and Microsoft Graph adapters sit behind the closed `ProviderClient`
//! enum; callers never branch on provider strings. Both adapters translate
//! their wire shapes into the types in this module.

pub mod gmail;
pub mod outlook;

use crate::error::ProviderError;
use crate::models::ProviderKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub use gmail::GmailClient;
pub use outlook::OutlookClient;

/// Request for one page of a message listing.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub page_token: Option<String>,
    pub page_size: usize,
    pub query: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRef {
    pub external_id: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
    pub total_estimate: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteAttachment {
    pub external_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

/// A fully fetched provider message, normalized across providers.
#[derive(Debug, Clone, Default)]
pub struct RemoteMessage {
    pub external_id: String,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub snippet: String,
    pub labels: Vec<String>,
    pub is_read: bool,
    pub is_draft: bool,
    pub is_outbound: bool,
    pub has_attachment: bool,
    pub folder: String,
    pub received_at: Option<DateTime<Utc>>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<RemoteAttachment>,
}

/// One entry from the provider change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryChange {
    Added {
        external_id: String,
    },
    LabelsChanged {
        external_id: String,
        added: Vec<String>,
        removed: Vec<String>,
    },
    Deleted {
        external_id: String,
    },
}

impl HistoryChange {
    pub fn external_id(&self) -> &str {
        match self {
            HistoryChange::Added { external_id }
            | HistoryChange::LabelsChanged { external_id, .. }
            | HistoryChange::Deleted { external_id } => external_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub changes: Vec<HistoryChange>,
    pub next_page_token: Option<String>,
    /// The cursor the provider reports as current, once the page sequence
    /// completes.
    pub latest_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OutgoingMail {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub in_reply_to: Option<String>,
    pub thread_id: Option<String>,
}

/// Per-message mutations the providers support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteModify {
    MarkRead,
    MarkUnread,
    Archive,
    Trash,
    Delete,
    Star,
    Unstar,
    AddLabel(String),
    RemoveLabel(String),
    Move(String),
}

#[derive(Debug, Clone)]
pub struct WatchRequest {
    /// HTTPS endpoint provider notifications are delivered to (Graph).
    pub callback_url: String,
    /// Pub/Sub topic carried in the Gmail watch body.
    pub pubsub_topic: String,
    /// Shared secret echoed back by Graph notifications.
    pub client_state: String,
}

#[derive(Debug, Clone)]
pub struct WatchSubscription {
    pub subscription_id: String,
    pub resource_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Cursor position at subscription time, when the provider reports one.
    pub initial_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub email: String,
    pub history_cursor: Option<String>,
}

/// Builds provider clients over one shared HTTP client. Base URLs are
/// overridable so tests can point at a mock server.
#[derive(Clone)]
pub struct ProviderRegistry {
    http: reqwest::Client,
    gmail_base: String,
    outlook_base: String,
}

impl ProviderRegistry {
    pub fn new() -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("sync-worker/0.1")
            .build()
            .map_err(ProviderError::Http)?;

        Ok(Self {
            http,
            gmail_base: gmail::DEFAULT_BASE_URL.to_string(),
            outlook_base: outlook::DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_gmail_base(mut self, base: impl Into<String>) -> Self {
        self.gmail_base = base.into();
        self
    }

    pub fn with_outlook_base(mut self, base: impl Into<String>) -> Self {
        self.outlook_base = base.into();
        self
    }

    pub fn client(&self, kind: ProviderKind) -> ProviderClient {
        match kind {
            ProviderKind::Gmail => {
                ProviderClient::Gmail(GmailClient::new(self.http.clone(), self.gmail_base.clone()))
            }
            ProviderKind::Outlook => ProviderClient::Outlook(OutlookClient::new(
                self.http.clone(),
                self.outlook_base.clone(),
            )),
        }
    }
}

/// Closed set of provider adapters.
#[derive(Clone)]
pub enum ProviderClient {
    Gmail(GmailClient),
    Outlook(OutlookClient),
}

impl ProviderClient {
    pub async fn get_profile(&self, token: &str) -> Result<ProviderProfile, ProviderError> {
        match self {
            ProviderClient::Gmail(c) => c.get_profile(token).await,
            ProviderClient::Outlook(c) => c.get_profile(token).await,
        }
    }

    /// List one page of message references. `page_size == 0` yields an empty
    /// page, not an error.
    pub async fn list_messages(
        &self,
        token: &str,
        request: &PageRequest,
    ) -> Result<MessagePage, ProviderError> {
        if request.page_size == 0 {
            return Ok(MessagePage::default());
        }
        match self {
            ProviderClient::Gmail(c) => c.list_messages(token, request).await,
            ProviderClient::Outlook(c) => c.list_messages(token, request).await,
        }
    }

    pub async fn get_message(
        &self,
        token: &str,
        external_id: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        match self {
            ProviderClient::Gmail(c) => c.get_message(token, external_id).await,
            ProviderClient::Outlook(c) => c.get_message(token, external_id).await,
        }
    }

    /// Fetch full messages for a page of references with bounded concurrency.
    /// Results preserve the input order. Individual fetch failures abort the
    /// batch so the caller retries the page as a unit.
    pub async fn fetch_messages(
        &self,
        token: &str,
        refs: &[MessageRef],
        parallelism: usize,
    ) -> Result<Vec<RemoteMessage>, ProviderError> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut set = JoinSet::new();

        for (index, message_ref) in refs.iter().enumerate() {
            let semaphore = semaphore.clone();
            let client = self.clone();
            let token = token.to_string();
            let external_id = message_ref.external_id.clone();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let message = client.get_message(&token, &external_id).await?;
                Ok::<_, ProviderError>((index, message))
            });
        }

        let mut by_index: HashMap<usize, RemoteMessage> = HashMap::with_capacity(refs.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok((index, message))) => {
                    by_index.insert(index, message);
                }
                Ok(Err(err)) => {
                    set.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    log::error!("provider: fetch task failed: {}", join_err);
                    set.abort_all();
                    return Err(ProviderError::status(
                        reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                        "message fetch task aborted".to_string(),
                    ));
                }
            }
        }

        let mut messages = Vec::with_capacity(refs.len());
        for index in 0..refs.len() {
            if let Some(message) = by_index.remove(&index) {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Changes since `cursor`. `Err(CursorInvalid)` signals the caller to fall
    /// back to a bounded backfill.
    pub async fn history(
        &self,
        token: &str,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError> {
        match self {
            ProviderClient::Gmail(c) => c.history(token, cursor, page_token).await,
            ProviderClient::Outlook(c) => c.history(token, cursor, page_token).await,
        }
    }

    /// Send a message. Gmail reports the created message id; Graph does not.
    pub async fn send(
        &self,
        token: &str,
        mail: &OutgoingMail,
    ) -> Result<Option<String>, ProviderError> {
        match self {
            ProviderClient::Gmail(c) => c.send(token, mail).await,
            ProviderClient::Outlook(c) => c.send(token, mail).await,
        }
    }

    pub async fn modify(
        &self,
        token: &str,
        external_id: &str,
        op: &RemoteModify,
    ) -> Result<(), ProviderError> {
        match self {
            ProviderClient::Gmail(c) => c.modify(token, external_id, op).await,
            ProviderClient::Outlook(c) => c.modify(token, external_id, op).await,
        }
    }

    pub async fn watch_subscribe(
        &self,
        token: &str,
        request: &WatchRequest,
    ) -> Result<WatchSubscription, ProviderError> {
        match self {
            ProviderClient::Gmail(c) => c.watch_subscribe(token, request).await,
            ProviderClient::Outlook(c) => c.watch_subscribe(token, request).await,
        }
    }

    /// Renew an existing channel. Gmail has no renew call; re-subscribing
    /// extends the expiry. Graph patches the subscription in place.
    pub async fn watch_renew(
        &self,
        token: &str,
        subscription_id: &str,
        request: &WatchRequest,
    ) -> Result<WatchSubscription, ProviderError> {
        match self {
            ProviderClient::Gmail(c) => c.watch_subscribe(token, request).await,
            ProviderClient::Outlook(c) => c.watch_renew(token, subscription_id).await,
        }
    }

    pub async fn watch_stop(
        &self,
        token: &str,
        subscription_id: &str,
    ) -> Result<(), ProviderError> {
        match self {
            ProviderClient::Gmail(c) => c.watch_stop(token).await,
            ProviderClient::Outlook(c) => c.watch_stop(token, subscription_id).await,
        }
    }

    /// Listing query that bounds a fallback re-walk to the last `days` days.
    pub fn recent_window_query(&self, days: i64) -> Option<String> {
        match self {
            ProviderClient::Gmail(_) => Some(format!("newer_than:{days}d")),
            ProviderClient::Outlook(_) => {
                let since = Utc::now() - chrono::Duration::days(days);
                Some(format!(
                    "receivedDateTime ge {}",
                    since.format("%Y-%m-%dT%H:%M:%SZ")
                ))
            }
        }
    }
}

/// Shared response check: success passes through, anything else becomes a
/// status-with-body error so callers can classify it.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ProviderError::Unauthorized(body));
    }
    Err(ProviderError::Status { status, body })
}
