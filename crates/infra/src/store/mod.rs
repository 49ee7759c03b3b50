//! Persistence seams for jobs, orders and payments.
//!
//! Two traits split the storage surface the way the engine uses it:
//!
//! - [`JobStore`]: the job queue (enqueue, due lookup, compare-and-swap claim, lease sweep)
//! - [`OrderStore`]: order/payment reads plus [`OrderStore::commit`], the single atomic
//!   write path shared by workers and webhook reconcilers
//!
//! Both are implemented by [`InMemoryFulfillmentStore`] (tests/dev) and
//! [`PostgresFulfillmentStore`] (sqlx).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use fulfillment_core::OrderId;
use fulfillment_orders::{Order, Payment, StoreSettings};

use crate::jobs::{Job, JobId, JobType};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryFulfillmentStore;
pub use postgres::PostgresFulfillmentStore;

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },
}

/// Rows written together in one transaction.
///
/// Job handlers return the order/payment changes of a successful execution;
/// the worker adds the finished job before committing.
///
/// Commits are optimistic. Orders and payments must carry the `version` they
/// were read at, and the job must still hold the lease it was claimed with
/// (`InProgress`, same `claimed_at`). Otherwise nothing is written and the
/// commit fails with [`StoreError::Conflict`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub job: Option<Job>,
    pub order: Option<Order>,
    pub payment: Option<Payment>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.job = Some(job);
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_payment(mut self, payment: Payment) -> Self {
        self.payment = Some(payment);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.job.is_none() && self.order.is_none() && self.payment.is_none()
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Durable job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job unless a non-terminal job of the same type already exists
    /// for the order. Returns the id of the job that is active afterwards.
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// The pending or in-progress job of `job_type` for an order, if any.
    async fn find_active(
        &self,
        order_id: OrderId,
        job_type: JobType,
    ) -> Result<Option<Job>, StoreError>;

    /// Pending jobs of `job_type` whose `next_run_at` is unset or not after `now`,
    /// oldest first.
    async fn find_due(
        &self,
        job_type: JobType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Compare-and-swap `PENDING -> IN_PROGRESS`.
    ///
    /// Returns `None` when the job is no longer pending (another poller won).
    async fn claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Write back a job this process claimed.
    ///
    /// Fenced like [`OrderStore::commit`]: fails with [`StoreError::Conflict`]
    /// once the stored job is no longer `InProgress` under the same `claimed_at`.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Return in-progress jobs claimed before `cutoff` to pending.
    async fn release_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;
}

/// Order and payment persistence.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn find_order_by_tracking_id(&self, tracking_id: &str)
    -> Result<Option<Order>, StoreError>;

    async fn find_order_by_shipping_order_id(
        &self,
        shipping_order_id: &str,
    ) -> Result<Option<Order>, StoreError>;

    async fn find_payment_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Most recent payment for the order that was ever captured (`PAID` or `REFUNDED`).
    async fn latest_settled_payment(&self, order_id: OrderId)
    -> Result<Option<Payment>, StoreError>;

    async fn store_settings(&self) -> Result<Option<StoreSettings>, StoreError>;

    /// Write every row in the change set atomically, bumping the `version`
    /// of each order and payment written. See [`ChangeSet`] for the checks.
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_set_builder() {
        let now = Utc::now();
        let changes = ChangeSet::new();
        assert!(changes.is_empty());

        let changes = changes.with_job(Job::shipping(OrderId::new(), now));
        assert!(!changes.is_empty());
        assert!(changes.order.is_none());
    }
}
