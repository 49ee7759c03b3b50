//! Fulfillment job engine.
//!
//! ## Components
//!
//! - `Job`: durable unit of work (shipping or refund) with retry bookkeeping
//! - `BackoffPolicy`: retry schedule and retryable/terminal classification
//! - `JobWorker`: periodic poller driving one job type through a `JobHandler`
//! - `ShippingJobHandler` / `RefundJobHandler`: the gateway side effects
//! - `StaleJobSweeper`: returns jobs with expired leases to the queue
//! - `JobQueue`: producer-side enqueue helpers

pub mod backoff;
pub mod error;
pub mod queue;
pub mod refund;
pub mod shipping;
pub mod sweeper;
pub mod types;
pub mod worker;

pub use backoff::{BackoffPolicy, ErrorClass, RetryDecision};
pub use error::JobError;
pub use queue::JobQueue;
pub use refund::{RefundJobHandler, refund_idempotency_key};
pub use shipping::ShippingJobHandler;
pub use sweeper::StaleJobSweeper;
pub use types::{Job, JobId, JobKind, JobStatus, JobType};
pub use worker::{JobHandler, JobWorker, TickReport, WorkerConfig, WorkerHandle};
