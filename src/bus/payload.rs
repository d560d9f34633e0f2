//! Typed job payloads, one schema per topic.
//!
//! Payloads are validated at the bus boundary: a record whose payload does
//! not decode for its topic is dead-lettered immediately instead of being
//! retried into oblivion.

use super::topics;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("no payload schema for topic {0}")]
    UnknownTopic(String),
    #[error("invalid payload for topic {topic}: {source}")]
    Invalid {
        topic: String,
        source: serde_json::Error,
    },
}

/// Why a `mail.sync` step was requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    Webhook,
    Gap,
    Retry,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSyncJob {
    pub user_id: Uuid,
    pub connection_id: i64,
    pub reason: SyncReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSendJob {
    pub connection_id: i64,
    pub modifier_id: Uuid,
}

/// Drains the pending modifier queue for one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailModifyJob {
    pub connection_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailBatchJob {
    pub user_id: Uuid,
    pub connection_ids: Vec<i64>,
}

/// Fetch and mirror a single message by provider id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSaveJob {
    pub user_id: Uuid,
    pub connection_id: i64,
    pub external_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSyncJob {
    pub user_id: Uuid,
    pub connection_id: i64,
}

/// Derived per-email work; idempotent on `(email_id, op)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailOpJob {
    pub email_id: i64,
    pub op: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchIndexJob {
    pub email_ids: Vec<i64>,
}

/// Every job the worker understands, tagged by topic. Unknown payloads never
/// reach a handler.
#[derive(Debug, Clone)]
pub enum JobPayload {
    MailSync(MailSyncJob),
    MailSend(MailSendJob),
    MailBatch(MailBatchJob),
    MailSave(MailSaveJob),
    MailModify(MailModifyJob),
    CalendarSync(CalendarSyncJob),
    AiClassify(EmailOpJob),
    AiSummarize(EmailOpJob),
    AiReply(EmailOpJob),
    RagIndex(EmailOpJob),
    RagBatchIndex(BatchIndexJob),
}

impl JobPayload {
    pub fn decode(topic: &str, value: &Value) -> Result<Self, PayloadError> {
        fn parse<T: serde::de::DeserializeOwned>(
            topic: &str,
            value: &Value,
        ) -> Result<T, PayloadError> {
            serde_json::from_value(value.clone()).map_err(|source| PayloadError::Invalid {
                topic: topic.to_string(),
                source,
            })
        }

        match topic {
            topics::MAIL_SYNC => Ok(JobPayload::MailSync(parse(topic, value)?)),
            topics::MAIL_SEND => Ok(JobPayload::MailSend(parse(topic, value)?)),
            topics::MAIL_BATCH => Ok(JobPayload::MailBatch(parse(topic, value)?)),
            topics::MAIL_SAVE => Ok(JobPayload::MailSave(parse(topic, value)?)),
            topics::MAIL_MODIFY => Ok(JobPayload::MailModify(parse(topic, value)?)),
            topics::CALENDAR_SYNC => Ok(JobPayload::CalendarSync(parse(topic, value)?)),
            topics::AI_CLASSIFY => Ok(JobPayload::AiClassify(parse(topic, value)?)),
            topics::AI_SUMMARIZE => Ok(JobPayload::AiSummarize(parse(topic, value)?)),
            topics::AI_REPLY => Ok(JobPayload::AiReply(parse(topic, value)?)),
            topics::RAG_INDEX => Ok(JobPayload::RagIndex(parse(topic, value)?)),
            topics::RAG_BATCH_INDEX => Ok(JobPayload::RagBatchIndex(parse(topic, value)?)),
            other => Err(PayloadError::UnknownTopic(other.to_string())),
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            JobPayload::MailSync(_) => topics::MAIL_SYNC,
            JobPayload::MailSend(_) => topics::MAIL_SEND,
            JobPayload::MailBatch(_) => topics::MAIL_BATCH,
            JobPayload::MailSave(_) => topics::MAIL_SAVE,
            JobPayload::MailModify(_) => topics::MAIL_MODIFY,
            JobPayload::CalendarSync(_) => topics::CALENDAR_SYNC,
            JobPayload::AiClassify(_) => topics::AI_CLASSIFY,
            JobPayload::AiSummarize(_) => topics::AI_SUMMARIZE,
            JobPayload::AiReply(_) => topics::AI_REPLY,
            JobPayload::RagIndex(_) => topics::RAG_INDEX,
            JobPayload::RagBatchIndex(_) => topics::RAG_BATCH_INDEX,
        }
    }

    /// User-initiated mutations ride the priority lane so interactive latency
    /// never queues behind bulk sync.
    pub fn is_priority(&self) -> bool {
        matches!(self, JobPayload::MailSend(_) | JobPayload::MailModify(_))
    }

    pub fn encode(&self) -> Value {
        match self {
            JobPayload::MailSync(p) => serde_json::to_value(p),
            JobPayload::MailSend(p) => serde_json::to_value(p),
            JobPayload::MailBatch(p) => serde_json::to_value(p),
            JobPayload::MailSave(p) => serde_json::to_value(p),
            JobPayload::MailModify(p) => serde_json::to_value(p),
            JobPayload::CalendarSync(p) => serde_json::to_value(p),
            JobPayload::AiClassify(p) => serde_json::to_value(p),
            JobPayload::AiSummarize(p) => serde_json::to_value(p),
            JobPayload::AiReply(p) => serde_json::to_value(p),
            JobPayload::RagIndex(p) => serde_json::to_value(p),
            JobPayload::RagBatchIndex(p) => serde_json::to_value(p),
        }
        .unwrap_or(Value::Null)
    }
}
