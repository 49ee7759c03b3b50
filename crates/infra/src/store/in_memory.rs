use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fulfillment_core::{OrderId, PaymentId};
use fulfillment_orders::{Order, Payment, StoreSettings};

use super::{ChangeSet, JobStats, JobStore, OrderStore, StoreError};
use crate::jobs::{Job, JobId, JobStatus, JobType};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    orders: HashMap<OrderId, Order>,
    payments: HashMap<PaymentId, Payment>,
    settings: Option<StoreSettings>,
}

/// In-memory job/order/payment store.
///
/// Intended for tests/dev. Everything lives behind one lock so a
/// [`ChangeSet`] commit is atomic.
#[derive(Debug, Default)]
pub struct InMemoryFulfillmentStore {
    state: RwLock<State>,
}

impl InMemoryFulfillmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }

    /// Seed or replace an order (owned by the order-creation flow).
    pub fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        self.write()?.orders.insert(order.id, order);
        Ok(())
    }

    /// Seed or replace a payment. `external_id` must stay unique.
    pub fn insert_payment(&self, payment: Payment) -> Result<(), StoreError> {
        let mut state = self.write()?;
        check_external_id(&state, &payment)?;
        state.payments.insert(payment.id, payment);
        Ok(())
    }

    pub fn set_store_settings(&self, settings: StoreSettings) -> Result<(), StoreError> {
        self.write()?.settings = Some(settings);
        Ok(())
    }

    pub fn jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<_> = self.read()?.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    pub fn payment(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError> {
        Ok(self.read()?.payments.get(&payment_id).cloned())
    }
}

fn check_external_id(state: &State, payment: &Payment) -> Result<(), StoreError> {
    let taken = state
        .payments
        .values()
        .any(|p| p.id != payment.id && p.external_id == payment.external_id);
    if taken {
        return Err(StoreError::Conflict(format!(
            "payment external id {} already exists",
            payment.external_id
        )));
    }
    Ok(())
}

/// The stored job must still be `InProgress` under the writer's claim.
fn check_lease(state: &State, job: &Job) -> Result<(), StoreError> {
    let stored = state
        .jobs
        .get(&job.id)
        .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
    if stored.status != JobStatus::InProgress || stored.claimed_at != job.claimed_at {
        return Err(StoreError::Conflict(format!(
            "job {} is no longer held by this claim",
            job.id
        )));
    }
    Ok(())
}

fn check_version(
    kind: &str,
    id: impl std::fmt::Display,
    stored: Option<i64>,
    read: i64,
) -> Result<(), StoreError> {
    match stored {
        Some(current) if current != read => Err(StoreError::Conflict(format!(
            "{kind} {id} changed since it was read (version {read}, now {current})"
        ))),
        _ => Ok(()),
    }
}

fn active_job(state: &State, order_id: OrderId, job_type: JobType) -> Option<&Job> {
    state
        .jobs
        .values()
        .filter(|j| j.order_id == order_id && j.job_type() == job_type && !j.status.is_terminal())
        .min_by_key(|j| j.created_at)
}

#[async_trait]
impl JobStore for InMemoryFulfillmentStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError> {
        let mut state = self.write()?;
        if let Some(existing) = active_job(&state, job.order_id, job.job_type()) {
            return Ok(existing.id);
        }
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn find_active(
        &self,
        order_id: OrderId,
        job_type: JobType,
    ) -> Result<Option<Job>, StoreError> {
        Ok(active_job(&*self.read()?, order_id, job_type).cloned())
    }

    async fn find_due(
        &self,
        job_type: JobType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut due: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.job_type() == job_type && j.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) => Ok(job.mark_in_progress(now).then(|| job.clone())),
            None => Err(StoreError::NotFound(format!("job {job_id}"))),
        }
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.write()?;
        check_lease(&state, job)?;
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn release_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut state = self.write()?;
        let mut released = Vec::new();
        for job in state.jobs.values_mut() {
            let expired = job.status == JobStatus::InProgress
                && job.claimed_at.is_none_or(|claimed| claimed < cutoff);
            if expired {
                job.release_lease(now);
                released.push(job.id);
            }
        }
        Ok(released)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let state = self.read()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::InProgress => stats.in_progress += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl OrderStore for InMemoryFulfillmentStore {
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.read()?.orders.get(&order_id).cloned())
    }

    async fn find_order_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let state = self.read()?;
        Ok(state
            .orders
            .values()
            .find(|o| o.tracking_id.as_deref() == Some(tracking_id))
            .cloned())
    }

    async fn find_order_by_shipping_order_id(
        &self,
        shipping_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let state = self.read()?;
        Ok(state
            .orders
            .values()
            .find(|o| o.shipping_order_id.as_deref() == Some(shipping_order_id))
            .cloned())
    }

    async fn find_payment_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let state = self.read()?;
        Ok(state
            .payments
            .values()
            .find(|p| p.external_id == external_id)
            .cloned())
    }

    async fn latest_settled_payment(
        &self,
        order_id: OrderId,
    ) -> Result<Option<Payment>, StoreError> {
        let state = self.read()?;
        Ok(state
            .payments
            .values()
            .filter(|p| p.order_id == order_id && p.status.is_settled())
            .max_by_key(|p| (p.paid_at, p.created_at))
            .cloned())
    }

    async fn store_settings(&self) -> Result<Option<StoreSettings>, StoreError> {
        Ok(self.read()?.settings.clone())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let mut state = self.write()?;

        // Validate everything before touching state.
        if let Some(job) = &changes.job {
            check_lease(&state, job)?;
        }
        if let Some(payment) = &changes.payment {
            let stored = state.payments.get(&payment.id).map(|p| p.version);
            check_version("payment", payment.id, stored, payment.version)?;
            check_external_id(&state, payment)?;
        }
        if let Some(order) = &changes.order {
            let stored = state.orders.get(&order.id).map(|o| o.version);
            check_version("order", order.id, stored, order.version)?;
            if let Some(shipment) = &order.shipping_order_id {
                let taken = state
                    .orders
                    .values()
                    .any(|o| o.id != order.id && o.shipping_order_id.as_ref() == Some(shipment));
                if taken {
                    return Err(StoreError::Conflict(format!(
                        "shipping order id {shipment} belongs to another order"
                    )));
                }
            }
        }

        if let Some(job) = changes.job {
            state.jobs.insert(job.id, job);
        }
        if let Some(mut order) = changes.order {
            order.version += 1;
            state.orders.insert(order.id, order);
        }
        if let Some(mut payment) = changes.payment {
            payment.version += 1;
            state.payments.insert(payment.id, payment);
        }
        Ok(())
    }
}
