// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Trellis shared infrastructure
//!
//! Cross-cutting primitives used by the API server and the worker:
//!
//! - **Database**: Postgres pool construction and migrations
//! - **Queue**: the durable Redis-backed job queue with dedup and backoff
//! - **Periodic tasks**: cancellable fixed-interval background loops
//! - **Metrics**: pipeline counters/gauges with a JSON snapshot
//! - **Config**: environment-backed configuration

pub mod config;
pub mod metrics;
pub mod periodic;
pub mod pool;
pub mod queue;

pub use config::{PipelineConfig, QueueTuning};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use periodic::PeriodicTask;
pub use pool::{create_pool, run_migrations};
pub use queue::{DurableQueue, Job, QueueError, RetryDisposition};
