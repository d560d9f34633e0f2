//! Job execution: adaptive pool, typed dispatch and the bus consumer.

pub mod consumer;
pub mod dispatch;
pub mod pool;

pub use consumer::BusConsumer;
pub use dispatch::{Dispatcher, JobFailure, JobTimeouts};
pub use pool::{MetricsSnapshot, PoolJob, WorkerPool};
