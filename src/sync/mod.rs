//! Per-connection synchronization engine.
//!
//! Each connection walks a small state machine:
//!
//! ```text
//! none -> backfilling -> idle <-> incremental
//!              |            \
//!              v             -> watch_expired -> idle
//!        retry_scheduled -> (resume) | error
//! ```
//!
//! # Backfill
//!
//! The initial import pages through the provider listing, fetching full
//! messages with bounded parallelism. Every stored page commits together
//! with its `(page_token, synced_count)` checkpoint, so a restart resumes
//! from the last durable page instead of the beginning. Completion clears
//! the checkpoint, stamps `first_sync_completed_at` once, records the
//! provider's history cursor and subscribes the push channel.
//!
//! # Incremental
//!
//! Push events and gap ticks consume the provider change stream from the
//! persisted cursor. The cursor only advances after every derived
//! side-effect of a step has succeeded; a partial failure leaves it in
//! place and the step re-runs. All mail writes are idempotent upserts keyed
//! `(user_id, connection_id, external_id)`, so duplicate delivery converges.
//!
//! An invalidated cursor falls back to a bounded recent-window page walk.
//!
//! # Concurrency
//!
//! A Postgres advisory lock keyed by connection id enforces the
//! single-writer invariant: at most one sync step per connection, across
//! all worker processes.

pub mod backoff;
pub mod engine;

pub use engine::SyncEngine;
