use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use fulfillment_core::OrderId;

use super::types::{Job, JobId};
use crate::store::{JobStore, StoreError};

/// Producer-side entry point for order-lifecycle events.
///
/// Enqueueing is idempotent per (order, job type) while a job is still
/// pending or in progress: the existing job id is returned.
#[derive(Clone)]
pub struct JobQueue {
    jobs: Arc<dyn JobStore>,
}

impl JobQueue {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Called once a payment for the order is captured.
    pub async fn enqueue_shipping_job(&self, order_id: OrderId) -> Result<JobId, StoreError> {
        let job_id = self.jobs.enqueue(Job::shipping(order_id, Utc::now())).await?;
        info!(order_id = %order_id, job_id = %job_id, "shipping job enqueued");
        Ok(job_id)
    }

    /// Called on cancellation or an explicit refund request. The amount is
    /// validated when the job runs.
    pub async fn enqueue_refund_job(
        &self,
        order_id: OrderId,
        amount: i64,
        reason: impl Into<String>,
    ) -> Result<JobId, StoreError> {
        let job_id = self
            .jobs
            .enqueue(Job::refund(order_id, amount, reason, Utc::now()))
            .await?;
        info!(order_id = %order_id, job_id = %job_id, amount, "refund job enqueued");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobKind, JobStatus};
    use crate::store::InMemoryFulfillmentStore;

    #[tokio::test]
    async fn duplicate_events_reuse_the_active_job() {
        let store = InMemoryFulfillmentStore::arc();
        let queue = JobQueue::new(store.clone());
        let order_id = OrderId::new();

        let a = queue.enqueue_shipping_job(order_id).await.unwrap();
        let b = queue.enqueue_shipping_job(order_id).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.jobs().unwrap().len(), 1);

        let refund = queue
            .enqueue_refund_job(order_id, 1_000, "cancelled")
            .await
            .unwrap();
        let job = store.get(refund).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.kind, JobKind::refund(1_000, "cancelled"));
    }
}
