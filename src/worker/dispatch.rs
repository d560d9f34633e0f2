//! Typed job dispatch.
//!
//! The routing table is a match over the closed `JobPayload` set, so adding
//! a topic without a handler is a compile error, not a runtime surprise.
//! Handlers classify failures: retryable errors leave the record unacked
//! for redelivery, fatal ones dead-letter.

use crate::bus::payload::{JobPayload, MailSyncJob, SyncReason};
use crate::bus::{Bus, topics};
use crate::config::WorkerConfig;
use crate::modifier::ModifierEngine;
use crate::sync::SyncEngine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobFailure {
    /// Leave the record unacked; the bus redelivers it.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Dead-letter the record immediately.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Per-type execution timeouts; anything unlisted gets the global default.
#[derive(Debug, Clone)]
pub struct JobTimeouts {
    per_topic: HashMap<&'static str, Duration>,
    default: Duration,
}

impl JobTimeouts {
    pub fn new(config: &WorkerConfig) -> Self {
        let mut per_topic = HashMap::new();
        // Sync steps page through the provider; give them room.
        per_topic.insert(topics::MAIL_SYNC, Duration::from_secs(300));
        per_topic.insert(topics::CALENDAR_SYNC, Duration::from_secs(300));
        per_topic.insert(topics::MAIL_BATCH, Duration::from_secs(120));
        per_topic.insert(topics::RAG_BATCH_INDEX, Duration::from_secs(120));

        Self {
            per_topic,
            default: config.default_job_timeout,
        }
    }

    pub fn timeout_for(&self, topic: &str) -> Duration {
        self.per_topic.get(topic).copied().unwrap_or(self.default)
    }
}

pub struct Dispatcher {
    engine: Arc<SyncEngine>,
    modifiers: Arc<ModifierEngine>,
    bus: Bus,
    timeouts: JobTimeouts,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<SyncEngine>,
        modifiers: Arc<ModifierEngine>,
        bus: Bus,
        timeouts: JobTimeouts,
    ) -> Self {
        Self {
            engine,
            modifiers,
            bus,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &JobTimeouts {
        &self.timeouts
    }

    pub async fn handle(&self, payload: &JobPayload) -> Result<(), JobFailure> {
        match payload {
            JobPayload::MailSync(job) => {
                self.engine.run_sync(job).await.map_err(classify_sync)
            }
            JobPayload::MailSave(job) => {
                self.engine.save_single(job).await.map_err(classify_sync)
            }
            JobPayload::MailSend(job) => self
                .modifiers
                .apply_single(job.modifier_id)
                .await
                .map_err(classify_modifier),
            JobPayload::MailModify(job) => self
                .modifiers
                .apply_pending(job.connection_id)
                .await
                .map(|_| ())
                .map_err(classify_modifier),
            JobPayload::MailBatch(job) => {
                for connection_id in &job.connection_ids {
                    let sync = MailSyncJob {
                        user_id: job.user_id,
                        connection_id: *connection_id,
                        reason: SyncReason::Manual,
                        cursor_hint: None,
                    };
                    self.bus
                        .publish(topics::MAIL_SYNC, &JobPayload::MailSync(sync).encode())
                        .await
                        .map_err(|err| JobFailure::Retryable(err.to_string()))?;
                }
                Ok(())
            }
            // Adapter seam: AI, indexing and calendar work belongs to the
            // external collaborators; the core validates and acks.
            JobPayload::CalendarSync(job) => {
                log::debug!("dispatch: calendar.sync for connection {}", job.connection_id);
                Ok(())
            }
            JobPayload::AiClassify(job)
            | JobPayload::AiSummarize(job)
            | JobPayload::AiReply(job) => {
                log::debug!("dispatch: {} for email {}", payload.topic(), job.email_id);
                Ok(())
            }
            JobPayload::RagIndex(job) => {
                log::debug!("dispatch: rag.index for email {}", job.email_id);
                Ok(())
            }
            JobPayload::RagBatchIndex(job) => {
                log::debug!("dispatch: rag.batch_index for {} emails", job.email_ids.len());
                Ok(())
            }
        }
    }
}

fn classify_sync(err: crate::error::SyncError) -> JobFailure {
    if err.is_retryable() {
        JobFailure::Retryable(err.to_string())
    } else {
        JobFailure::Fatal(err.to_string())
    }
}

fn classify_modifier(err: crate::error::ModifierError) -> JobFailure {
    if err.is_retryable() {
        JobFailure::Retryable(err.to_string())
    } else {
        JobFailure::Fatal(err.to_string())
    }
}
