//! Background task wiring: one worker per job type plus the lease sweeper.

use std::sync::Arc;

use tracing::info;

use crate::config::JobsConfig;
use crate::gateways::{PaymentGateway, ShippingGateway};
use crate::jobs::{
    JobWorker, RefundJobHandler, ShippingJobHandler, StaleJobSweeper, WorkerConfig, WorkerHandle,
};
use crate::notifications::NotificationSink;
use crate::store::{JobStore, OrderStore};

pub struct FulfillmentRuntime {
    shipping: Arc<JobWorker>,
    refund: Arc<JobWorker>,
    sweeper: Arc<StaleJobSweeper>,
}

impl FulfillmentRuntime {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        orders: Arc<dyn OrderStore>,
        shipping_gateway: Arc<dyn ShippingGateway>,
        payment_gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSink>,
        config: &JobsConfig,
    ) -> Self {
        let worker_config = WorkerConfig {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            execution_timeout: config.gateway_timeout,
        };

        let shipping = JobWorker::new(
            "shipping-worker",
            jobs.clone(),
            orders.clone(),
            Arc::new(ShippingJobHandler::new(orders.clone(), shipping_gateway)),
            notifier.clone(),
        )
        .with_config(worker_config.clone());

        let refund = JobWorker::new(
            "refund-worker",
            jobs.clone(),
            orders.clone(),
            Arc::new(RefundJobHandler::new(orders, payment_gateway)),
            notifier,
        )
        .with_config(worker_config);

        let sweeper = StaleJobSweeper::new(jobs, config.lease_timeout, config.sweep_interval);

        Self {
            shipping: Arc::new(shipping),
            refund: Arc::new(refund),
            sweeper: Arc::new(sweeper),
        }
    }

    pub fn shipping_worker(&self) -> &Arc<JobWorker> {
        &self.shipping
    }

    pub fn refund_worker(&self) -> &Arc<JobWorker> {
        &self.refund
    }

    pub fn start(&self) -> RuntimeHandle {
        let tasks = vec![
            Arc::clone(&self.shipping).spawn(),
            Arc::clone(&self.refund).spawn(),
            Arc::clone(&self.sweeper).spawn(),
        ];
        info!(tasks = tasks.len(), "fulfillment runtime started");
        RuntimeHandle { tasks }
    }
}

#[derive(Debug)]
pub struct RuntimeHandle {
    tasks: Vec<WorkerHandle>,
}

impl RuntimeHandle {
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(WorkerHandle::name).collect()
    }

    /// Stop every task, letting in-flight ticks finish.
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.shutdown().await;
        }
        info!("fulfillment runtime stopped");
    }
}
