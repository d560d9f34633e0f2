//! Persistence layer.
//!
//! Repositories are thin structs over the shared `PgPool` returning domain
//! types directly. Bulk operations that must be atomic with other writes
//! (mail batches + checkpoints) take a `&mut PgConnection` so callers control
//! the transaction boundary.

pub mod body;
pub mod connection;
pub mod email;
pub mod modifier;
pub mod sync_state;
pub mod webhook;

pub use body::{BodyDraft, CompressionStats, MailBodyRepository};
pub use connection::{ConnectionRepository, NewConnection};
pub use email::{AiResult, EmailRepository, MailDraft, MailListQuery, UpsertedMail};
pub use modifier::{ModifierRepository, NewModifier};
pub use sync_state::{RetryDue, StaleConnection, SyncStateRepository};
pub use webhook::{NewWebhook, WebhookRepository};
