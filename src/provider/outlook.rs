//! Microsoft Graph adapter.
//!
//! Paging rides `@odata.nextLink` (the full URL doubles as the page token),
//! change tracking uses delta queries (the delta link doubles as the history
//! cursor), and push channels are Graph subscriptions with a `clientState`
//! shared secret.

use super::{
    check_response, HistoryChange, HistoryPage, MessagePage, MessageRef, OutgoingMail,
    PageRequest, ProviderProfile, RemoteAttachment, RemoteMessage, RemoteModify, WatchRequest,
    WatchSubscription,
};
use crate::error::ProviderError;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Graph subscriptions for messages max out at 4230 minutes.
const SUBSCRIPTION_MINUTES: i64 = 4230;

#[derive(Clone)]
pub struct OutlookClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaResponse {
    #[serde(default)]
    value: Vec<DeltaEntry>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaEntry {
    id: String,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    #[serde(default)]
    id: String,
    conversation_id: Option<String>,
    internet_message_id: Option<String>,
    subject: Option<String>,
    body_preview: Option<String>,
    body: Option<GraphBody>,
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    cc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    bcc_recipients: Vec<GraphRecipient>,
    is_read: Option<bool>,
    is_draft: Option<bool>,
    has_attachments: Option<bool>,
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: String,
    resource: Option<String>,
    expiration_date_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    mail: Option<String>,
    user_principal_name: Option<String>,
}

impl OutlookClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn get_profile(&self, token: &str) -> Result<ProviderProfile, ProviderError> {
        let response = self
            .http
            .get(self.url("me"))
            .bearer_auth(token)
            .send()
            .await?;
        let me: MeResponse = check_response(response).await?.json().await?;

        Ok(ProviderProfile {
            email: me.mail.or(me.user_principal_name).unwrap_or_default(),
            // The change cursor comes from a delta round, not the profile.
            history_cursor: None,
        })
    }

    pub async fn list_messages(
        &self,
        token: &str,
        request: &PageRequest,
    ) -> Result<MessagePage, ProviderError> {
        // A page token is the full nextLink URL from the previous page.
        let builder = match &request.page_token {
            Some(next_link) => self.http.get(next_link),
            None => {
                let mut query: Vec<(&str, String)> = vec![
                    ("$top", request.page_size.to_string()),
                    ("$orderby", "receivedDateTime desc".to_string()),
                ];
                if let Some(filter) = &request.query {
                    query.push(("$filter", filter.clone()));
                }
                self.http.get(self.url("me/messages")).query(&query)
            }
        };

        let response = builder.bearer_auth(token).send().await?;
        let list: ListResponse = check_response(response).await?.json().await?;

        Ok(MessagePage {
            messages: list
                .value
                .into_iter()
                .map(|message| MessageRef {
                    thread_id: message.conversation_id.clone(),
                    external_id: message.id,
                })
                .collect(),
            next_page_token: list.next_link,
            total_estimate: None,
        })
    }

    pub async fn get_message(
        &self,
        token: &str,
        external_id: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("me/messages/{external_id}")))
            .bearer_auth(token)
            .send()
            .await?;
        let message: GraphMessage = check_response(response).await?.json().await?;

        Ok(into_remote(message))
    }

    /// Delta query. An empty cursor bootstraps at the current position via
    /// `$deltatoken=latest`; the returned delta link is the next cursor.
    pub async fn history(
        &self,
        token: &str,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError> {
        let builder = if let Some(next_link) = page_token {
            self.http.get(next_link)
        } else if cursor.is_empty() {
            self.http
                .get(self.url("me/mailFolders/inbox/messages/delta"))
                .query(&[("$deltatoken", "latest")])
        } else if cursor.starts_with("http") {
            self.http.get(cursor)
        } else {
            self.http
                .get(self.url("me/mailFolders/inbox/messages/delta"))
                .query(&[("$deltatoken", cursor)])
        };

        let response = builder.bearer_auth(token).send().await?;

        // Graph reports an expired delta token as 410 Gone.
        if response.status() == StatusCode::GONE {
            return Err(ProviderError::CursorInvalid);
        }
        let delta: DeltaResponse = check_response(response).await?.json().await?;

        let changes = delta
            .value
            .into_iter()
            .map(|entry| {
                if entry.removed.is_some() {
                    HistoryChange::Deleted {
                        external_id: entry.id,
                    }
                } else {
                    HistoryChange::Added {
                        external_id: entry.id,
                    }
                }
            })
            .collect();

        Ok(HistoryPage {
            changes,
            next_page_token: delta.next_link,
            latest_cursor: delta.delta_link,
        })
    }

    /// Graph accepts the message and returns 202 without a message id.
    pub async fn send(
        &self,
        token: &str,
        mail: &OutgoingMail,
    ) -> Result<Option<String>, ProviderError> {
        let recipients = |addrs: &[String]| {
            addrs
                .iter()
                .map(|a| json!({ "emailAddress": { "address": a } }))
                .collect::<Vec<_>>()
        };

        let body = json!({
            "message": {
                "subject": mail.subject,
                "body": {
                    "contentType": if mail.html.is_some() { "HTML" } else { "Text" },
                    "content": mail.html.clone().or_else(|| mail.text.clone()).unwrap_or_default(),
                },
                "toRecipients": recipients(&mail.to),
                "ccRecipients": recipients(&mail.cc),
                "bccRecipients": recipients(&mail.bcc),
            },
            "saveToSentItems": true,
        });

        let response = self
            .http
            .post(self.url("me/sendMail"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        check_response(response).await?;
        Ok(None)
    }

    pub async fn modify(
        &self,
        token: &str,
        external_id: &str,
        op: &RemoteModify,
    ) -> Result<(), ProviderError> {
        match op {
            RemoteModify::MarkRead => self.patch(token, external_id, json!({"isRead": true})).await,
            RemoteModify::MarkUnread => {
                self.patch(token, external_id, json!({"isRead": false})).await
            }
            RemoteModify::Star => {
                self.patch(token, external_id, json!({"flag": {"flagStatus": "flagged"}}))
                    .await
            }
            RemoteModify::Unstar => {
                self.patch(
                    token,
                    external_id,
                    json!({"flag": {"flagStatus": "notFlagged"}}),
                )
                .await
            }
            RemoteModify::AddLabel(label) | RemoteModify::RemoveLabel(label) => {
                // Graph categories are replace-only; read-modify-write.
                let current = self.get_message(token, external_id).await?;
                let mut labels = current.labels;
                match op {
                    RemoteModify::AddLabel(_) => {
                        if !labels.contains(label) {
                            labels.push(label.clone());
                        }
                    }
                    _ => labels.retain(|l| l != label),
                }
                self.patch(token, external_id, json!({ "categories": labels }))
                    .await
            }
            RemoteModify::Archive => self.move_to(token, external_id, "archive").await,
            RemoteModify::Trash => self.move_to(token, external_id, "deleteditems").await,
            RemoteModify::Move(folder) => self.move_to(token, external_id, folder).await,
            RemoteModify::Delete => {
                let response = self
                    .http
                    .delete(self.url(&format!("me/messages/{external_id}")))
                    .bearer_auth(token)
                    .send()
                    .await?;
                check_response(response).await?;
                Ok(())
            }
        }
    }

    async fn patch(
        &self,
        token: &str,
        external_id: &str,
        body: serde_json::Value,
    ) -> Result<(), ProviderError> {
        let response = self
            .http
            .patch(self.url(&format!("me/messages/{external_id}")))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }

    async fn move_to(
        &self,
        token: &str,
        external_id: &str,
        destination: &str,
    ) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(self.url(&format!("me/messages/{external_id}/move")))
            .bearer_auth(token)
            .json(&json!({ "destinationId": destination }))
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }

    pub async fn watch_subscribe(
        &self,
        token: &str,
        request: &WatchRequest,
    ) -> Result<WatchSubscription, ProviderError> {
        let expiration = Utc::now() + chrono::Duration::minutes(SUBSCRIPTION_MINUTES);
        let response = self
            .http
            .post(self.url("subscriptions"))
            .bearer_auth(token)
            .json(&json!({
                "changeType": "created,updated,deleted",
                "notificationUrl": request.callback_url,
                "resource": "/me/messages",
                "expirationDateTime": expiration.to_rfc3339(),
                "clientState": request.client_state,
            }))
            .send()
            .await?;
        let subscription: SubscriptionResponse = check_response(response).await?.json().await?;

        Ok(WatchSubscription {
            subscription_id: subscription.id,
            resource_id: subscription.resource,
            expires_at: subscription.expiration_date_time,
            initial_cursor: None,
        })
    }

    pub async fn watch_renew(
        &self,
        token: &str,
        subscription_id: &str,
    ) -> Result<WatchSubscription, ProviderError> {
        let expiration = Utc::now() + chrono::Duration::minutes(SUBSCRIPTION_MINUTES);
        let response = self
            .http
            .patch(self.url(&format!("subscriptions/{subscription_id}")))
            .bearer_auth(token)
            .json(&json!({ "expirationDateTime": expiration.to_rfc3339() }))
            .send()
            .await?;
        let subscription: SubscriptionResponse = check_response(response).await?.json().await?;

        Ok(WatchSubscription {
            subscription_id: subscription.id,
            resource_id: subscription.resource,
            expires_at: subscription.expiration_date_time,
            initial_cursor: None,
        })
    }

    pub async fn watch_stop(
        &self,
        token: &str,
        subscription_id: &str,
    ) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.url(&format!("subscriptions/{subscription_id}")))
            .bearer_auth(token)
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }
}

fn addresses(recipients: &[GraphRecipient]) -> Vec<String> {
    recipients
        .iter()
        .filter_map(|r| r.email_address.as_ref())
        .filter_map(|a| a.address.clone())
        .collect()
}

fn into_remote(message: GraphMessage) -> RemoteMessage {
    let (html, text) = match &message.body {
        Some(body) => {
            let content = body.content.clone();
            match body.content_type.as_deref() {
                Some("html") | Some("HTML") => (content, None),
                _ => (None, content),
            }
        }
        None => (None, None),
    };

    // Attachment metadata arrives from a separate endpoint; mark them pending
    // until a later fetch resolves the real ids.
    let attachments = if message.has_attachments.unwrap_or(false) {
        vec![RemoteAttachment {
            external_id: format!("pending_{}", uuid::Uuid::new_v4().simple()),
            filename: String::new(),
            mime_type: "application/octet-stream".to_string(),
            size: 0,
            content_id: None,
            is_inline: false,
        }]
    } else {
        Vec::new()
    };

    RemoteMessage {
        thread_id: message.conversation_id.clone(),
        message_id: message.internet_message_id.clone(),
        in_reply_to: None,
        references: Vec::new(),
        from: message
            .from
            .as_ref()
            .and_then(|r| r.email_address.as_ref())
            .and_then(|a| a.address.clone())
            .unwrap_or_default(),
        to: addresses(&message.to_recipients),
        cc: addresses(&message.cc_recipients),
        bcc: addresses(&message.bcc_recipients),
        subject: message.subject.clone().unwrap_or_default(),
        snippet: message.body_preview.clone().unwrap_or_default(),
        labels: message.categories.clone(),
        is_read: message.is_read.unwrap_or(false),
        is_draft: message.is_draft.unwrap_or(false),
        is_outbound: false,
        has_attachment: message.has_attachments.unwrap_or(false),
        folder: "inbox".to_string(),
        received_at: message.received_date_time,
        html,
        text,
        attachments,
        external_id: message.id,
    }
}
