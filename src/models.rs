//! Domain entities persisted by the repositories.
//!
//! Enums bind to Postgres enum types; structs derive `sqlx::FromRow` so the
//! repositories scan rows directly into domain values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "provider_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gmail,
    Outlook,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Outlook => "outlook",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "gmail" => Ok(ProviderKind::Gmail),
            "outlook" => Ok(ProviderKind::Outlook),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// A user-owned OAuth connection to a provider account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Connection {
    pub id: i64,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub account_email: String,
    /// Encrypted opaque token material; decryption happens outside the core.
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub is_connected: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "sync_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    None,
    Backfilling,
    Idle,
    Incremental,
    RetryScheduled,
    WatchExpired,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "sync_phase", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Initial,
    Incremental,
}

/// Per-connection synchronization state. One row per connection.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncState {
    pub id: i64,
    pub connection_id: i64,
    pub status: SyncStatus,
    pub phase: SyncPhase,
    pub history_cursor: Option<String>,
    pub watch_expiry: Option<DateTime<Utc>>,
    pub watch_resource_id: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub checkpoint_page_token: Option<String>,
    pub checkpoint_synced_count: i64,
    pub checkpoint_total_count: i64,
    pub total_synced: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub first_sync_completed_at: Option<DateTime<Utc>>,
    pub avg_sync_duration_ms: i64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "mail_direction", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MailDirection {
    Inbound,
    Outbound,
}

/// Mirrored mail metadata. The body is stored separately.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Mail {
    pub id: i64,
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
    pub tags: Vec<String>,
    pub workflow_status: Option<String>,
    pub snooze_until: Option<DateTime<Utc>>,
    pub ai_status: String,
    pub ai_category: Option<String>,
    pub ai_sub_category: Option<String>,
    pub ai_priority: Option<f32>,
    pub ai_summary: Option<String>,
    pub ai_tags: Vec<String>,
    pub contact_id: Option<i64>,
    pub received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decompressed mail body as handed back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailBody {
    pub email_id: i64,
    pub html: Option<String>,
    pub text: Option<String>,
    pub is_compressed: bool,
    pub original_size: i64,
    pub compressed_size: i64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_days: i32,
    pub attachments_meta: Value,
}

pub const PENDING_ATTACHMENT_PREFIX: &str = "pending_";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attachment {
    pub id: i64,
    pub email_id: i64,
    /// May carry a `pending_…` sentinel until a later fetch resolves it.
    pub external_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub content_id: Option<String>,
    pub is_inline: bool,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn is_pending(&self) -> bool {
        self.external_id.starts_with(PENDING_ATTACHMENT_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "modifier_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModifierType {
    MarkRead,
    MarkUnread,
    Archive,
    Trash,
    Delete,
    Star,
    Unstar,
    AddLabel,
    RemoveLabel,
    Send,
    Move,
}

impl ModifierType {
    /// Version-sensitive mutations conflict when the client observed an older
    /// version than the server holds.
    pub fn is_version_sensitive(&self) -> bool {
        matches!(
            self,
            ModifierType::Send | ModifierType::Move | ModifierType::Delete | ModifierType::Trash
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "modifier_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModifierStatus {
    Pending,
    Applied,
    Failed,
    Conflict,
}

/// A durably queued client mutation intent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Modifier {
    pub id: Uuid,
    pub user_id: Uuid,
    pub connection_id: i64,
    pub mod_type: ModifierType,
    pub status: ModifierStatus,
    pub email_id: Option<i64>,
    pub external_id: Option<String>,
    pub thread_id: Option<String>,
    pub params: Value,
    pub client_version: i64,
    pub server_version: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "version_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    User,
    Provider,
}

/// Monotonic per-email version, bumped on every server-accepted mutation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailVersion {
    pub email_id: i64,
    pub version: i64,
    pub mod_type: String,
    pub mod_source: VersionSource,
    pub mod_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "conflict_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Version,
    Deleted,
    Moved,
    Permission,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "conflict_resolution", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    DiscardLocal,
    ApplyLocal,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conflict {
    pub id: i64,
    pub modifier_id: Uuid,
    pub conflict_type: ConflictType,
    pub client_state: Value,
    pub server_state: Value,
    pub resolution: Option<ConflictResolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "webhook_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Active,
    Expired,
    Failed,
    Disabled,
}

/// A provider push channel. Unique per `(connection_id, resource_type)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    pub id: i64,
    pub connection_id: i64,
    pub provider: ProviderKind,
    pub resource_type: String,
    pub subscription_id: String,
    pub resource_id: Option<String>,
    pub channel_id: Option<String>,
    pub status: WebhookStatus,
    pub failure_count: i32,
    pub expires_at: DateTime<Utc>,
    pub last_renewed_at: Option<DateTime<Utc>>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const WEBHOOK_RESOURCE_MAIL: &str = "mail";
pub const WEBHOOK_RESOURCE_CALENDAR: &str = "calendar";
