//! Bus consumer loop.
//!
//! Reads batches for the worker group, validates payloads at the boundary,
//! and hands jobs to the pool. Records whose payload does not decode are
//! dead-lettered immediately; records past the delivery budget are
//! dead-lettered; pool rejection leaves the record pending so it redelivers
//! once pressure drops. A periodic stale-claim pass adopts records from
//! crashed consumers.

use super::dispatch::{Dispatcher, JobFailure};
use super::pool::{PoolJob, WorkerPool};
use crate::bus::payload::JobPayload;
use crate::bus::{Bus, BusRecord, topics};
use crate::config::ConsumerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const ACK_ATTEMPTS: u32 = 5;

pub struct BusConsumer {
    bus: Bus,
    pool: WorkerPool,
    dispatcher: Arc<Dispatcher>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
}

impl BusConsumer {
    pub fn new(
        bus: Bus,
        pool: WorkerPool,
        dispatcher: Arc<Dispatcher>,
        config: ConsumerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            pool,
            dispatcher,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        log::info!(
            "consumer {} started (group {})",
            self.config.consumer,
            self.config.group
        );
        let mut last_claim = Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if last_claim.elapsed() >= self.config.pending_check_interval {
                last_claim = Instant::now();
                match self
                    .bus
                    .claim_stale(
                        &self.config.group,
                        &self.config.consumer,
                        self.config.claim_idle,
                        self.config.batch_size,
                    )
                    .await
                {
                    Ok(claimed) => self.process_batch(claimed).await,
                    Err(err) => log::error!("consumer: stale claim failed: {}", err),
                }
            }

            let batch = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                batch = self.bus.subscribe(
                    &self.config.group,
                    &self.config.consumer,
                    topics::ALL,
                    self.config.batch_size,
                    self.config.block_timeout,
                ) => batch,
            };

            match batch {
                Ok(records) => self.process_batch(records).await,
                Err(err) => {
                    log::error!("consumer: subscribe failed: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        log::info!("consumer {} stopped", self.config.consumer);
    }

    async fn process_batch(&self, records: Vec<BusRecord>) {
        for record in records {
            if record.delivery_count > self.config.max_deliveries as i32 {
                let reason = format!(
                    "exceeded {} deliveries (at {})",
                    self.config.max_deliveries, record.delivery_count
                );
                if let Err(err) = self.bus.dead_letter(&record.topic, record.id, &reason).await {
                    log::error!("consumer: dead-letter failed for {}/{}: {}", record.topic, record.id, err);
                }
                continue;
            }

            let payload = match JobPayload::decode(&record.topic, &record.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    // Malformed payloads never become valid; straight to DLQ.
                    let reason = err.to_string();
                    if let Err(err) = self.bus.dead_letter(&record.topic, record.id, &reason).await
                    {
                        log::error!(
                            "consumer: dead-letter failed for {}/{}: {}",
                            record.topic,
                            record.id,
                            err
                        );
                    }
                    continue;
                }
            };

            let priority = payload.is_priority();
            let job = self.build_job(record, payload);

            let outcome = if priority {
                self.pool.submit_priority(job)
            } else {
                self.pool.submit(job)
            };
            if let Err(rejected) = outcome {
                // Backpressure: leave the record pending, it will be claimed
                // and redelivered once the queue drains.
                log::debug!(
                    "consumer: pool full, {} job deferred for redelivery",
                    rejected.label
                );
            }
        }
    }

    fn build_job(&self, record: BusRecord, payload: JobPayload) -> PoolJob {
        let topic = payload.topic();
        let timeout = self.dispatcher.timeouts().timeout_for(topic);
        let dispatcher = self.dispatcher.clone();
        let bus = self.bus.clone();
        let group = self.config.group.clone();

        PoolJob::new(topic, timeout, async move {
            match dispatcher.handle(&payload).await {
                Ok(()) => ack_with_retry(&bus, &group, &record.topic, record.id).await,
                Err(JobFailure::Retryable(reason)) => {
                    log::warn!(
                        "consumer: {}/{} failed, leaving for redelivery: {}",
                        record.topic,
                        record.id,
                        reason
                    );
                }
                Err(JobFailure::Fatal(reason)) => {
                    log::error!(
                        "consumer: {}/{} failed fatally: {}",
                        record.topic,
                        record.id,
                        reason
                    );
                    if let Err(err) = bus.dead_letter(&record.topic, record.id, &reason).await {
                        log::error!(
                            "consumer: dead-letter failed for {}/{}: {}",
                            record.topic,
                            record.id,
                            err
                        );
                    }
                }
            }
        })
    }
}

async fn ack_with_retry(bus: &Bus, group: &str, topic: &str, id: i64) {
    for attempt in 1..=ACK_ATTEMPTS {
        match bus.ack(group, topic, id).await {
            Ok(()) => return,
            Err(err) if attempt < ACK_ATTEMPTS => {
                log::warn!(
                    "consumer: ack {}/{} attempt {} failed: {}",
                    topic,
                    id,
                    attempt,
                    err
                );
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            Err(err) => {
                // Give up; the record redelivers and the handler is
                // idempotent.
                log::error!("consumer: ack {}/{} abandoned: {}", topic, id, err);
            }
        }
    }
}
