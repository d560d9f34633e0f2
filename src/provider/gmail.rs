//! Gmail REST adapter.
//!
//! Speaks the `gmail/v1` API: message listing with `format=full` fetches,
//! the history delta endpoint, label-based modify operations, and the
//! Pub/Sub-backed watch lifecycle. Message bodies arrive base64url-encoded
//! inside a recursive MIME part tree.

use super::{
    check_response, HistoryChange, HistoryPage, MessagePage, MessageRef, OutgoingMail,
    PageRequest, ProviderProfile, RemoteAttachment, RemoteMessage, RemoteModify, WatchRequest,
    WatchSubscription,
};
use crate::error::ProviderError;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

const LABEL_UNREAD: &str = "UNREAD";
const LABEL_STARRED: &str = "STARRED";
const LABEL_DRAFT: &str = "DRAFT";
const LABEL_INBOX: &str = "INBOX";
const LABEL_SENT: &str = "SENT";
const LABEL_TRASH: &str = "TRASH";
const LABEL_SPAM: &str = "SPAM";

#[derive(Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<ListEntry>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    result_size_estimate: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailPart {
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    #[serde(rename = "attachmentId")]
    attachment_id: Option<String>,
    #[serde(default)]
    size: i64,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(rename = "messagesAdded", default)]
    messages_added: Vec<HistoryMessageWrapper>,
    #[serde(rename = "messagesDeleted", default)]
    messages_deleted: Vec<HistoryMessageWrapper>,
    #[serde(rename = "labelsAdded", default)]
    labels_added: Vec<HistoryLabelChange>,
    #[serde(rename = "labelsRemoved", default)]
    labels_removed: Vec<HistoryLabelChange>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessageWrapper {
    message: HistoryMessage,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryLabelChange {
    message: HistoryMessage,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    #[serde(rename = "historyId")]
    history_id: Option<String>,
    /// Epoch millis as a decimal string.
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

impl GmailClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn get_profile(&self, token: &str) -> Result<ProviderProfile, ProviderError> {
        let response = self
            .http
            .get(self.url("profile"))
            .bearer_auth(token)
            .send()
            .await?;
        let profile: ProfileResponse = check_response(response).await?.json().await?;

        Ok(ProviderProfile {
            email: profile.email_address,
            history_cursor: profile.history_id,
        })
    }

    pub async fn list_messages(
        &self,
        token: &str,
        request: &PageRequest,
    ) -> Result<MessagePage, ProviderError> {
        let mut query: Vec<(&str, String)> =
            vec![("maxResults", request.page_size.to_string())];
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.clone()));
        }
        if let Some(q) = &request.query {
            query.push(("q", q.clone()));
        }

        let response = self
            .http
            .get(self.url("messages"))
            .query(&query)
            .bearer_auth(token)
            .send()
            .await?;
        let list: ListResponse = check_response(response).await?.json().await?;

        Ok(MessagePage {
            messages: list
                .messages
                .into_iter()
                .map(|entry| MessageRef {
                    external_id: entry.id,
                    thread_id: entry.thread_id,
                })
                .collect(),
            next_page_token: list.next_page_token,
            total_estimate: list.result_size_estimate,
        })
    }

    pub async fn get_message(
        &self,
        token: &str,
        external_id: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("messages/{external_id}")))
            .query(&[("format", "full")])
            .bearer_auth(token)
            .send()
            .await?;
        let message: GmailMessage = check_response(response).await?.json().await?;

        Ok(into_remote(message))
    }

    pub async fn history(
        &self,
        token: &str,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError> {
        let mut query: Vec<(&str, String)> = vec![("startHistoryId", cursor.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .http
            .get(self.url("history"))
            .query(&query)
            .bearer_auth(token)
            .send()
            .await?;

        // Gmail reports an expired/unknown start cursor as 404.
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::CursorInvalid);
        }
        let history: HistoryResponse = check_response(response).await?.json().await?;

        let mut changes = Vec::new();
        for entry in history.history {
            for added in entry.messages_added {
                changes.push(HistoryChange::Added {
                    external_id: added.message.id,
                });
            }
            for change in entry.labels_added {
                changes.push(HistoryChange::LabelsChanged {
                    external_id: change.message.id,
                    added: change.label_ids,
                    removed: Vec::new(),
                });
            }
            for change in entry.labels_removed {
                changes.push(HistoryChange::LabelsChanged {
                    external_id: change.message.id,
                    added: Vec::new(),
                    removed: change.label_ids,
                });
            }
            for deleted in entry.messages_deleted {
                changes.push(HistoryChange::Deleted {
                    external_id: deleted.message.id,
                });
            }
        }

        Ok(HistoryPage {
            changes,
            next_page_token: history.next_page_token,
            latest_cursor: history.history_id,
        })
    }

    pub async fn send(
        &self,
        token: &str,
        mail: &OutgoingMail,
    ) -> Result<Option<String>, ProviderError> {
        let raw = STANDARD.encode(build_rfc822(mail));
        let mut body = json!({ "raw": raw });
        if let Some(thread_id) = &mail.thread_id {
            body["threadId"] = json!(thread_id);
        }

        let response = self
            .http
            .post(self.url("messages/send"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let sent: SendResponse = check_response(response).await?.json().await?;

        Ok(Some(sent.id))
    }

    pub async fn modify(
        &self,
        token: &str,
        external_id: &str,
        op: &RemoteModify,
    ) -> Result<(), ProviderError> {
        let (add, remove): (Vec<String>, Vec<String>) = match op {
            RemoteModify::MarkRead => (vec![], vec![LABEL_UNREAD.into()]),
            RemoteModify::MarkUnread => (vec![LABEL_UNREAD.into()], vec![]),
            RemoteModify::Archive => (vec![], vec![LABEL_INBOX.into()]),
            RemoteModify::Star => (vec![LABEL_STARRED.into()], vec![]),
            RemoteModify::Unstar => (vec![], vec![LABEL_STARRED.into()]),
            RemoteModify::AddLabel(label) => (vec![label.clone()], vec![]),
            RemoteModify::RemoveLabel(label) => (vec![], vec![label.clone()]),
            RemoteModify::Move(folder) => {
                (vec![folder_to_label(folder)], vec![LABEL_INBOX.into()])
            }
            RemoteModify::Trash => {
                let response = self
                    .http
                    .post(self.url(&format!("messages/{external_id}/trash")))
                    .bearer_auth(token)
                    .send()
                    .await?;
                check_response(response).await?;
                return Ok(());
            }
            RemoteModify::Delete => {
                let response = self
                    .http
                    .delete(self.url(&format!("messages/{external_id}")))
                    .bearer_auth(token)
                    .send()
                    .await?;
                check_response(response).await?;
                return Ok(());
            }
        };

        let response = self
            .http
            .post(self.url(&format!("messages/{external_id}/modify")))
            .bearer_auth(token)
            .json(&json!({ "addLabelIds": add, "removeLabelIds": remove }))
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }

    /// Start (or extend) the push channel. The body carries the Pub/Sub topic
    /// per the documented API shape; the HTTPS push endpoint is configured on
    /// the Pub/Sub subscription, not here.
    pub async fn watch_subscribe(
        &self,
        token: &str,
        request: &WatchRequest,
    ) -> Result<WatchSubscription, ProviderError> {
        let response = self
            .http
            .post(self.url("watch"))
            .bearer_auth(token)
            .json(&json!({
                "topicName": request.pubsub_topic,
                "labelIds": [LABEL_INBOX],
            }))
            .send()
            .await?;
        let watch: WatchResponse = check_response(response).await?.json().await?;

        let expires_at = watch
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(7));

        Ok(WatchSubscription {
            subscription_id: request.pubsub_topic.clone(),
            resource_id: None,
            expires_at,
            initial_cursor: watch.history_id,
        })
    }

    pub async fn watch_stop(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(self.url("stop"))
            .bearer_auth(token)
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }
}

fn folder_to_label(folder: &str) -> String {
    match folder {
        "inbox" => LABEL_INBOX.to_string(),
        "trash" => LABEL_TRASH.to_string(),
        "spam" => LABEL_SPAM.to_string(),
        other => other.to_uppercase(),
    }
}

fn header<'a>(headers: &'a [GmailHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn split_addresses(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Gmail base64url payloads are usually unpadded, but not reliably so.
fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Depth-first walk of the MIME part tree collecting text, html and
/// attachment metadata.
fn walk_parts(
    part: &GmailPart,
    text: &mut Option<String>,
    html: &mut Option<String>,
    attachments: &mut Vec<RemoteAttachment>,
) {
    let body_data = part.body.as_ref().and_then(|b| b.data.as_deref());

    if !part.filename.is_empty() {
        if let Some(body) = &part.body {
            attachments.push(RemoteAttachment {
                external_id: body
                    .attachment_id
                    .clone()
                    .unwrap_or_else(|| format!("pending_{}", uuid::Uuid::new_v4().simple())),
                filename: part.filename.clone(),
                mime_type: part.mime_type.clone(),
                size: body.size,
                content_id: header(&part.headers, "Content-ID").map(|v| v.to_string()),
                is_inline: header(&part.headers, "Content-Disposition")
                    .map(|v| v.starts_with("inline"))
                    .unwrap_or(false),
            });
        }
    } else if part.mime_type == "text/plain" && text.is_none() {
        *text = body_data.and_then(decode_body);
    } else if part.mime_type == "text/html" && html.is_none() {
        *html = body_data.and_then(decode_body);
    }

    for child in &part.parts {
        walk_parts(child, text, html, attachments);
    }
}

fn into_remote(message: GmailMessage) -> RemoteMessage {
    let mut text = None;
    let mut html = None;
    let mut attachments = Vec::new();

    let (headers, folder, is_read, is_draft, is_outbound) = {
        let labels = &message.label_ids;
        let folder = if labels.iter().any(|l| l == LABEL_TRASH) {
            "trash"
        } else if labels.iter().any(|l| l == LABEL_SPAM) {
            "spam"
        } else if labels.iter().any(|l| l == LABEL_SENT) {
            "sent"
        } else if labels.iter().any(|l| l == LABEL_INBOX) {
            "inbox"
        } else {
            "archive"
        };

        let headers = message
            .payload
            .as_ref()
            .map(|p| p.headers.as_slice())
            .unwrap_or_default()
            .to_vec();

        (
            headers,
            folder.to_string(),
            !labels.iter().any(|l| l == LABEL_UNREAD),
            labels.iter().any(|l| l == LABEL_DRAFT),
            labels.iter().any(|l| l == LABEL_SENT),
        )
    };

    if let Some(payload) = &message.payload {
        walk_parts(payload, &mut text, &mut html, &mut attachments);
    }

    let received_at: Option<DateTime<Utc>> = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    RemoteMessage {
        external_id: message.id,
        thread_id: message.thread_id,
        message_id: header(&headers, "Message-ID").map(|v| v.to_string()),
        in_reply_to: header(&headers, "In-Reply-To").map(|v| v.to_string()),
        references: header(&headers, "References")
            .map(|v| v.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default(),
        from: header(&headers, "From").unwrap_or_default().to_string(),
        to: split_addresses(header(&headers, "To")),
        cc: split_addresses(header(&headers, "Cc")),
        bcc: split_addresses(header(&headers, "Bcc")),
        subject: header(&headers, "Subject").unwrap_or_default().to_string(),
        snippet: message.snippet,
        labels: message.label_ids,
        is_read,
        is_draft,
        is_outbound,
        has_attachment: !attachments.is_empty(),
        folder,
        received_at,
        html,
        text,
        attachments,
    }
}

fn build_rfc822(mail: &OutgoingMail) -> String {
    let mut out = String::new();
    out.push_str(&format!("To: {}\r\n", mail.to.join(", ")));
    if !mail.cc.is_empty() {
        out.push_str(&format!("Cc: {}\r\n", mail.cc.join(", ")));
    }
    if !mail.bcc.is_empty() {
        out.push_str(&format!("Bcc: {}\r\n", mail.bcc.join(", ")));
    }
    out.push_str(&format!("Subject: {}\r\n", mail.subject));
    if let Some(in_reply_to) = &mail.in_reply_to {
        out.push_str(&format!("In-Reply-To: {in_reply_to}\r\n"));
        out.push_str(&format!("References: {in_reply_to}\r\n"));
    }
    if let Some(html) = &mail.html {
        out.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
        out.push_str(html);
    } else {
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.push_str(mail.text.as_deref().unwrap_or_default());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(mime: &str, data: &str) -> GmailPart {
        GmailPart {
            mime_type: mime.to_string(),
            filename: String::new(),
            headers: Vec::new(),
            body: Some(GmailBody {
                attachment_id: None,
                size: data.len() as i64,
                data: Some(URL_SAFE_NO_PAD.encode(data)),
            }),
            parts: Vec::new(),
        }
    }

    #[test]
    fn walks_multipart_tree_for_text_and_html() {
        let root = GmailPart {
            mime_type: "multipart/alternative".to_string(),
            filename: String::new(),
            headers: Vec::new(),
            body: None,
            parts: vec![part("text/plain", "hello"), part("text/html", "<p>hello</p>")],
        };

        let mut text = None;
        let mut html = None;
        let mut attachments = Vec::new();
        walk_parts(&root, &mut text, &mut html, &mut attachments);

        assert_eq!(text.as_deref(), Some("hello"));
        assert_eq!(html.as_deref(), Some("<p>hello</p>"));
        assert!(attachments.is_empty());
    }

    #[test]
    fn attachment_without_id_gets_pending_sentinel() {
        let root = GmailPart {
            mime_type: "application/pdf".to_string(),
            filename: "report.pdf".to_string(),
            headers: Vec::new(),
            body: Some(GmailBody {
                attachment_id: None,
                size: 1000,
                data: None,
            }),
            parts: Vec::new(),
        };

        let mut text = None;
        let mut html = None;
        let mut attachments = Vec::new();
        walk_parts(&root, &mut text, &mut html, &mut attachments);

        assert_eq!(attachments.len(), 1);
        assert!(attachments[0].external_id.starts_with("pending_"));
    }

    #[test]
    fn decodes_padded_and_unpadded_base64url() {
        let unpadded = URL_SAFE_NO_PAD.encode("abcd");
        let padded = URL_SAFE.encode("abcd");
        assert_eq!(decode_body(&unpadded).as_deref(), Some("abcd"));
        assert_eq!(decode_body(&padded).as_deref(), Some("abcd"));
    }

    #[test]
    fn rfc822_includes_reply_headers() {
        let mail = OutgoingMail {
            to: vec!["a@example.com".to_string()],
            subject: "Re: hi".to_string(),
            text: Some("body".to_string()),
            in_reply_to: Some("<msg-1@example.com>".to_string()),
            ..Default::default()
        };

        let raw = build_rfc822(&mail);
        assert!(raw.contains("In-Reply-To: <msg-1@example.com>"));
        assert!(raw.contains("Subject: Re: hi"));
        assert!(raw.ends_with("body"));
    }
}
