//! Periodic drivers.
//!
//! Three cadences from the sync design (retry-due scan, watch renewal,
//! stale-connection gap scan) plus housekeeping for expired bodies,
//! applied modifiers and acked bus records. Every loop logs failures and
//! keeps ticking; a scheduler never takes the process down.

use crate::bus::payload::{JobPayload, MailSyncJob, SyncReason};
use crate::bus::{Bus, topics};
use crate::config::SyncConfig;
use crate::repo::{MailBodyRepository, ModifierRepository, SyncStateRepository};
use crate::webhook::WebhookManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(30);
const WATCH_RENEW_INTERVAL: Duration = Duration::from_secs(300);
const GAP_SCAN_INTERVAL: Duration = Duration::from_secs(600);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

/// Applied modifiers older than this are pruned.
const APPLIED_RETENTION_DAYS: i64 = 30;

pub struct Schedulers {
    states: SyncStateRepository,
    bodies: MailBodyRepository,
    modifiers: ModifierRepository,
    webhooks: Arc<WebhookManager>,
    bus: Bus,
    sync_config: SyncConfig,
    shutdown: CancellationToken,
}

impl Schedulers {
    pub fn new(
        states: SyncStateRepository,
        bodies: MailBodyRepository,
        modifiers: ModifierRepository,
        webhooks: Arc<WebhookManager>,
        bus: Bus,
        sync_config: SyncConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            states,
            bodies,
            modifiers,
            webhooks,
            bus,
            sync_config,
            shutdown,
        }
    }

    /// Spawn every driver. The gap scan runs one sweep immediately so
    /// connections that went stale while the process was down catch up.
    pub fn spawn_all(self) {
        let this = Arc::new(self);

        {
            let this = this.clone();
            tokio::spawn(async move { this.run_retry_loop().await });
        }
        {
            let this = this.clone();
            tokio::spawn(async move { this.run_watch_loop().await });
        }
        {
            let this = this.clone();
            tokio::spawn(async move { this.run_gap_loop().await });
        }
        tokio::spawn(async move { this.run_housekeeping_loop().await });
    }

    async fn run_retry_loop(&self) {
        let mut ticker = tokio::time::interval(RETRY_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.scan_retries().await {
                log::error!("scheduler: retry scan failed: {}", err);
            }
        }
    }

    async fn scan_retries(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let due = self.states.get_pending_retries(Utc::now()).await?;
        for retry in due {
            let job = MailSyncJob {
                user_id: retry.user_id,
                connection_id: retry.connection_id,
                reason: SyncReason::Retry,
                cursor_hint: None,
            };
            self.bus
                .publish(topics::MAIL_SYNC, &JobPayload::MailSync(job).encode())
                .await?;
            self.states.resume(retry.connection_id, retry.phase).await?;
            log::info!(
                "scheduler: resumed connection {} ({:?})",
                retry.connection_id,
                retry.phase
            );
        }
        Ok(())
    }

    async fn run_watch_loop(&self) {
        let mut ticker = tokio::time::interval(WATCH_RENEW_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.webhooks.renew_expiring().await {
                Ok(0) => {}
                Ok(renewed) => log::info!("scheduler: renewed {} watch channels", renewed),
                Err(err) => log::error!("scheduler: watch renewal failed: {}", err),
            }
        }
    }

    async fn run_gap_loop(&self) {
        // Startup sweep first, then the periodic cadence.
        if let Err(err) = self.scan_gaps().await {
            log::error!("scheduler: startup gap sweep failed: {}", err);
        }

        let mut ticker = tokio::time::interval(GAP_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.scan_gaps().await {
                log::error!("scheduler: gap scan failed: {}", err);
            }
        }
    }

    async fn scan_gaps(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let stale = self
            .states
            .get_stale_connections(self.sync_config.stale_after)
            .await?;
        if stale.is_empty() {
            return Ok(());
        }

        log::info!("scheduler: {} stale connections need a gap sync", stale.len());
        for connection in stale {
            let job = MailSyncJob {
                user_id: connection.user_id,
                connection_id: connection.connection_id,
                reason: SyncReason::Gap,
                cursor_hint: None,
            };
            self.bus
                .publish(topics::MAIL_SYNC, &JobPayload::MailSync(job).encode())
                .await?;
        }
        Ok(())
    }

    async fn run_housekeeping_loop(&self) {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.bodies.cleanup_expired(Utc::now()).await {
                log::error!("scheduler: body cleanup failed: {}", err);
            }

            let cutoff = Utc::now() - chrono::Duration::days(APPLIED_RETENTION_DAYS);
            match self.modifiers.cleanup_applied_before(cutoff).await {
                Ok(0) => {}
                Ok(removed) => log::info!("scheduler: pruned {} applied modifiers", removed),
                Err(err) => log::error!("scheduler: modifier cleanup failed: {}", err),
            }

            for topic in topics::ALL {
                if let Err(err) = self.bus.trim_acked(topic).await {
                    log::error!("scheduler: bus trim failed for {}: {}", topic, err);
                }
            }
        }
    }
}
