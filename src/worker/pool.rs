//! Adaptive worker pool.
//!
//! Two lanes feed the workers: a bounded normal queue and a priority lane
//! for user-initiated mutations. `submit` never blocks; a full queue returns
//! the job to the caller so backpressure can propagate (leave the bus record
//! unacked and it redelivers).
//!
//! A scaler samples `in_flight / workers` on a fixed cadence: high
//! utilization spawns half again as many workers up to the max, low
//! utilization lets idle workers expire down to the min. Each job runs in
//! its own task with a per-type timeout, so panics and overruns are isolated
//! from the worker.

use crate::config::WorkerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Samples kept per job type for percentile estimates.
const LATENCY_WINDOW: usize = 512;

pub struct PoolJob {
    pub label: &'static str,
    pub timeout: Duration,
    task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
}

impl PoolJob {
    pub fn new(
        label: &'static str,
        timeout: Duration,
        task: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        Self {
            label,
            timeout,
            task: Box::pin(task),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub completed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub workers: usize,
    pub in_flight: usize,
    pub queue_depth: usize,
    pub priority_depth: usize,
    pub completed: u64,
    pub timed_out: u64,
    pub panicked: u64,
    pub per_type: HashMap<&'static str, LatencyPercentiles>,
}

#[derive(Default)]
struct TypeStats {
    samples: VecDeque<u64>,
    completed: u64,
}

struct PoolInner {
    config: WorkerConfig,
    normal: Mutex<VecDeque<PoolJob>>,
    priority: Mutex<VecDeque<PoolJob>>,
    notify: Notify,
    workers: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    timed_out: AtomicU64,
    panicked: AtomicU64,
    allow_scale_down: AtomicBool,
    stats: Mutex<HashMap<&'static str, TypeStats>>,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn pop(&self) -> Option<PoolJob> {
        if let Some(job) = self.priority.lock().pop_front() {
            return Some(job);
        }
        self.normal.lock().pop_front()
    }

    fn record(&self, label: &'static str, elapsed: Duration) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(label).or_default();
        entry.completed += 1;
        entry.samples.push_back(elapsed.as_millis() as u64);
        if entry.samples.len() > LATENCY_WINDOW {
            entry.samples.pop_front();
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, shutdown: CancellationToken) -> Self {
        let inner = Arc::new(PoolInner {
            config: config.clone(),
            normal: Mutex::new(VecDeque::new()),
            priority: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            workers: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            allow_scale_down: AtomicBool::new(false),
            stats: Mutex::new(HashMap::new()),
            shutdown,
        });

        let pool = Self { inner };
        for _ in 0..config.min_workers.max(1) {
            pool.spawn_worker();
        }
        pool.spawn_scaler();
        pool
    }

    fn spawn_worker(&self) {
        let inner = self.inner.clone();
        inner.workers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(worker_loop(inner));
    }

    fn spawn_scaler(&self) {
        let inner = self.inner.clone();
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.scale_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let workers = inner.workers.load(Ordering::SeqCst).max(1);
                let in_flight = inner.in_flight.load(Ordering::SeqCst);
                let utilization = in_flight as f64 / workers as f64;

                inner
                    .allow_scale_down
                    .store(utilization < inner.config.scale_down_threshold, Ordering::SeqCst);

                if utilization > inner.config.scale_up_threshold
                    && workers < inner.config.max_workers
                {
                    let to_spawn = workers
                        .div_ceil(2)
                        .min(inner.config.max_workers - workers);
                    for _ in 0..to_spawn {
                        pool.spawn_worker();
                    }
                    log::info!(
                        "pool: utilization {:.2}, scaled up by {} to {}",
                        utilization,
                        to_spawn,
                        workers + to_spawn
                    );
                }

                if log::log_enabled!(log::Level::Debug) {
                    if let Ok(snapshot) = serde_json::to_string(&pool.metrics()) {
                        log::debug!("pool: {}", snapshot);
                    }
                }
            }
        });
    }

    /// Submit to the bounded normal queue. A full queue rejects immediately,
    /// handing the job back to the caller.
    pub fn submit(&self, job: PoolJob) -> Result<(), PoolJob> {
        {
            let mut queue = self.inner.normal.lock();
            if queue.len() >= self.inner.config.queue_size {
                return Err(job);
            }
            queue.push_back(job);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Priority lane for interactive mutations. Bounded at twice the normal
    /// queue so a runaway producer still hits backpressure.
    pub fn submit_priority(&self, job: PoolJob) -> Result<(), PoolJob> {
        {
            let mut queue = self.inner.priority.lock();
            if queue.len() >= self.inner.config.queue_size * 2 {
                return Err(job);
            }
            queue.push_back(job);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let stats = self.inner.stats.lock();
        let per_type = stats
            .iter()
            .map(|(label, stat)| {
                let mut sorted: Vec<u64> = stat.samples.iter().copied().collect();
                sorted.sort_unstable();
                let pct = |p: f64| -> u64 {
                    if sorted.is_empty() {
                        return 0;
                    }
                    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
                    sorted[idx]
                };
                (
                    *label,
                    LatencyPercentiles {
                        p50_ms: pct(0.50),
                        p90_ms: pct(0.90),
                        p95_ms: pct(0.95),
                        p99_ms: pct(0.99),
                        completed: stat.completed,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            workers: self.inner.workers.load(Ordering::SeqCst),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            queue_depth: self.inner.normal.lock().len(),
            priority_depth: self.inner.priority.lock().len(),
            completed: self.inner.completed.load(Ordering::SeqCst),
            timed_out: self.inner.timed_out.load(Ordering::SeqCst),
            panicked: self.inner.panicked.load(Ordering::SeqCst),
            per_type,
        }
    }

    /// Wait for in-flight work to drain, up to `grace`. Queued-but-unstarted
    /// jobs are dropped; their bus records are unacked and will redeliver.
    pub async fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                log::warn!(
                    "pool: grace period expired with {} jobs in flight",
                    self.inner.in_flight.load(Ordering::SeqCst)
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let Some(job) = inner.pop() else {
            let idle = inner.config.idle_timeout;
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                woken = tokio::time::timeout(idle, inner.notify.notified()) => {
                    if woken.is_err() {
                        // Idle past the timeout: expire if scaling down is
                        // allowed and the floor holds.
                        let workers = inner.workers.load(Ordering::SeqCst);
                        if inner.allow_scale_down.load(Ordering::SeqCst)
                            && workers > inner.config.min_workers
                            && inner
                                .workers
                                .compare_exchange(
                                    workers,
                                    workers - 1,
                                    Ordering::SeqCst,
                                    Ordering::SeqCst,
                                )
                                .is_ok()
                        {
                            log::debug!("pool: idle worker exiting ({} remain)", workers - 1);
                            return;
                        }
                    }
                    continue;
                }
            }
        };

        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let label = job.label;

        // Each job runs in its own task: a panic kills the task, not the
        // worker, and the un-acked record redelivers.
        let mut handle = tokio::spawn(job.task);
        match tokio::time::timeout(job.timeout, &mut handle).await {
            Ok(Ok(())) => {
                inner.completed.fetch_add(1, Ordering::SeqCst);
                inner.record(label, started.elapsed());
            }
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    inner.panicked.fetch_add(1, Ordering::SeqCst);
                    log::error!("pool: {} job panicked: {}", label, join_err);
                } else {
                    log::warn!("pool: {} job cancelled", label);
                }
            }
            Err(_) => {
                handle.abort();
                inner.timed_out.fetch_add(1, Ordering::SeqCst);
                log::warn!("pool: {} job exceeded {:?}, aborting", label, job.timeout);
            }
        }

        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    inner.workers.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(min: usize, max: usize, queue: usize) -> WorkerConfig {
        WorkerConfig {
            min_workers: min,
            max_workers: max,
            queue_size: queue,
            scale_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(100),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            default_job_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn runs_submitted_jobs() {
        let pool = WorkerPool::new(test_config(2, 4, 16), CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = counter.clone();
            let job = PoolJob::new("test", Duration::from_secs(1), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            pool.submit(job).map_err(|_| ()).expect("accepted");
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(pool.metrics().completed, 8);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let pool = WorkerPool::new(test_config(1, 1, 2), CancellationToken::new());

        // Occupy the only worker.
        let blocker = PoolJob::new("block", Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        pool.submit(blocker).map_err(|_| ()).expect("accepted");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Fill the queue, then the next submit must bounce immediately.
        for _ in 0..2 {
            let job = PoolJob::new("fill", Duration::from_secs(1), async {});
            pool.submit(job).map_err(|_| ()).expect("queued");
        }

        let started = Instant::now();
        let rejected = pool.submit(PoolJob::new("reject", Duration::from_secs(1), async {}));
        assert!(rejected.is_err());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn priority_jobs_run_before_queued_normal_jobs() {
        let pool = WorkerPool::new(test_config(1, 1, 16), CancellationToken::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Block the worker so both queues fill while it is busy.
        pool.submit(PoolJob::new("block", Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }))
        .map_err(|_| ())
        .expect("accepted");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let order_normal = order.clone();
        pool.submit(PoolJob::new("normal", Duration::from_secs(1), async move {
            order_normal.lock().push("normal");
        }))
        .map_err(|_| ())
        .expect("queued");

        let order_priority = order.clone();
        pool.submit_priority(PoolJob::new(
            "priority",
            Duration::from_secs(1),
            async move {
                order_priority.lock().push("priority");
            },
        ))
        .map_err(|_| ())
        .expect("queued");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*order.lock(), vec!["priority", "normal"]);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_worker() {
        let pool = WorkerPool::new(test_config(1, 1, 16), CancellationToken::new());

        pool.submit(PoolJob::new("boom", Duration::from_secs(1), async {
            panic!("boom");
        }))
        .map_err(|_| ())
        .expect("accepted");

        let counter = Arc::new(AtomicUsize::new(0));
        let after = counter.clone();
        pool.submit(PoolJob::new("after", Duration::from_secs(1), async move {
            after.fetch_add(1, Ordering::SeqCst);
        }))
        .map_err(|_| ())
        .expect("accepted");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().panicked, 1);
    }

    #[tokio::test]
    async fn overrunning_job_is_aborted_at_its_timeout() {
        let pool = WorkerPool::new(test_config(1, 1, 16), CancellationToken::new());

        pool.submit(PoolJob::new("slow", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }))
        .map_err(|_| ())
        .expect("accepted");

        let counter = Arc::new(AtomicUsize::new(0));
        let after = counter.clone();
        pool.submit(PoolJob::new("next", Duration::from_secs(1), async move {
            after.fetch_add(1, Ordering::SeqCst);
        }))
        .map_err(|_| ())
        .expect("accepted");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().timed_out, 1);
    }

    #[tokio::test]
    async fn scales_up_under_sustained_load() {
        let pool = WorkerPool::new(test_config(1, 4, 64), CancellationToken::new());

        for _ in 0..16 {
            pool.submit(PoolJob::new("busy", Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }))
            .map_err(|_| ())
            .expect("queued");
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(pool.metrics().workers > 1, "pool should have scaled up");
    }
}
