use reqwest::StatusCode;
use thiserror::Error;

/// Errors from the Gmail / Microsoft Graph adapters.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("provider credentials rejected: {0}")]
    Unauthorized(String),
    #[error("history cursor no longer valid")]
    CursorInvalid,
    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn status(status: StatusCode, body: String) -> Self {
        ProviderError::Status { status, body }
    }

    /// Retryable with backoff: throttling, server errors, connection trouble.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(err) => err.is_timeout() || err.is_connect(),
            ProviderError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Errors from the token refresh path.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("token HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("refresh grant rejected; connection {0} disconnected")]
    InvalidGrant(i64),
    #[error("connection {0} not found")]
    UnknownConnection(i64),
    #[error("connection {0} is disconnected")]
    Disconnected(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl OAuthError {
    pub fn is_transient(&self) -> bool {
        match self {
            OAuthError::Http(err) => err.is_timeout() || err.is_connect(),
            OAuthError::Status { status, .. } => status.is_server_error(),
            OAuthError::Database(_) => true,
            _ => false,
        }
    }
}

/// Errors from the job bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unknown record {topic}/{id}")]
    UnknownRecord { topic: String, id: i64 },
}

/// Errors from a sync step.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection {0} not found")]
    UnknownConnection(i64),
    #[error("connection {0} already backfilling")]
    AlreadyBackfilling(i64),
    #[error("connection {0} busy; another sync step holds the lock")]
    Busy(i64),
    #[error("connection {0} is disconnected")]
    Disconnected(i64),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("retries exhausted for connection {0}")]
    RetriesExhausted(i64),
}

impl SyncError {
    /// Whether the failed step should be redelivered rather than dead-lettered.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Busy(_) => true,
            SyncError::Provider(err) => err.is_transient(),
            SyncError::OAuth(err) => err.is_transient(),
            SyncError::Bus(_) | SyncError::Database(_) => true,
            _ => false,
        }
    }
}

/// Errors from the modifier engine.
#[derive(Debug, Error)]
pub enum ModifierError {
    #[error("modifier {0} not found")]
    UnknownModifier(uuid::Uuid),
    #[error("modifier {0} is not in conflict")]
    NotInConflict(uuid::Uuid),
    #[error("modifier {0} targets no email")]
    MissingTarget(uuid::Uuid),
    #[error("connection {0} busy; another drain holds the lock")]
    Busy(i64),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ModifierError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ModifierError::Busy(_) => true,
            ModifierError::Provider(err) => err.is_transient(),
            ModifierError::OAuth(err) => err.is_transient(),
            ModifierError::Bus(_) | ModifierError::Database(_) => true,
            _ => false,
        }
    }
}

/// Errors from webhook lifecycle management.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("no webhook registered for subscription {0}")]
    UnknownSubscription(String),
    #[error("push notification failed authentication: {0}")]
    BadSignature(String),
    #[error("malformed push payload: {0}")]
    BadPayload(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
