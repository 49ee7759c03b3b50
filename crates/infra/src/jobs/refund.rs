//! Refund job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use fulfillment_core::OrderId;
use fulfillment_orders::{Order, Payment, PaymentStatus};

use super::error::JobError;
use super::types::{Job, JobKind, JobType};
use super::worker::JobHandler;
use crate::gateways::{PaymentGateway, RefundRequest};
use crate::store::{ChangeSet, OrderStore};

/// Deterministic per order, so a retry after a crash cannot refund twice.
pub fn refund_idempotency_key(order_id: OrderId) -> String {
    format!("refund-{order_id}")
}

pub struct RefundJobHandler {
    orders: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl RefundJobHandler {
    pub fn new(orders: Arc<dyn OrderStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { orders, gateway }
    }

    async fn load_payment(&self, job: &Job) -> Result<Payment, JobError> {
        self.orders
            .latest_settled_payment(job.order_id)
            .await?
            .ok_or_else(|| {
                JobError::precondition(format!("no paid payment found for order {}", job.order_id))
            })
    }

    async fn load_order(&self, job: &Job) -> Result<Order, JobError> {
        self.orders
            .get_order(job.order_id)
            .await?
            .ok_or_else(|| JobError::precondition(format!("order {} not found", job.order_id)))
    }
}

#[async_trait]
impl JobHandler for RefundJobHandler {
    fn job_type(&self) -> JobType {
        JobType::Refund
    }

    async fn execute(&self, job: &Job) -> Result<ChangeSet, JobError> {
        let JobKind::Refund { amount, reason } = &job.kind else {
            return Err(JobError::precondition(format!(
                "job {} is not a refund job",
                job.id
            )));
        };

        let payment = self.load_payment(job).await?;

        if payment.status == PaymentStatus::Refunded {
            debug!(order_id = %job.order_id, payment_id = %payment.id, "payment already refunded");
            return Ok(ChangeSet::new());
        }

        if *amount <= 0 || *amount > payment.amount {
            return Err(JobError::precondition(format!(
                "invalid refund amount {amount} for payment of {}",
                payment.amount
            )));
        }
        let invoice_id = payment.gateway_invoice_id.clone().ok_or_else(|| {
            JobError::precondition(format!("payment {} has no gateway invoice", payment.id))
        })?;

        self.load_order(job).await?;

        let key = refund_idempotency_key(job.order_id);
        let response = self
            .gateway
            .create_refund(RefundRequest {
                invoice_id,
                amount: *amount,
                external_refund_id: key.clone(),
                reason: reason.clone(),
                idempotency_key: key,
            })
            .await?;
        info!(
            order_id = %job.order_id,
            payment_id = %payment.id,
            refund_id = %response.id,
            refund_status = %response.status,
            "refund created"
        );

        // Webhooks may have written either row during the call.
        let mut payment = self.load_payment(job).await?;
        if payment.status == PaymentStatus::Refunded {
            return Ok(ChangeSet::new());
        }
        let mut order = self.load_order(job).await?;
        let now = Utc::now();
        payment.mark_refunded(now)?;
        order.mark_refunded(now);
        Ok(ChangeSet::new().with_order(order).with_payment(payment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use fulfillment_core::PaymentId;
    use fulfillment_orders::OrderStatus;

    use crate::gateways::{GatewayError, RefundResponse};
    use crate::jobs::{JobStatus, JobWorker};
    use crate::notifications::InMemoryNotificationSink;
    use crate::store::{InMemoryFulfillmentStore, JobStore};
    use crate::webhooks::ShippingWebhookReconciler;

    #[derive(Default)]
    struct FakePaymentGateway {
        requests: Mutex<Vec<RefundRequest>>,
        fail_with: Option<u16>,
    }

    impl FakePaymentGateway {
        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PaymentGateway for FakePaymentGateway {
        async fn create_refund(
            &self,
            request: RefundRequest,
        ) -> Result<RefundResponse, GatewayError> {
            self.requests.lock().unwrap().push(request);
            if let Some(status) = self.fail_with {
                return Err(GatewayError::Http {
                    status,
                    body: "refund rejected".into(),
                });
            }
            Ok(RefundResponse {
                id: "rf-1".into(),
                status: "SUCCEEDED".into(),
            })
        }
    }

    /// Delivers a shipping callback for the order before confirming the refund.
    struct ShippingCallbackDuringRefund {
        order_id: OrderId,
        webhook: ShippingWebhookReconciler,
    }

    #[async_trait]
    impl PaymentGateway for ShippingCallbackDuringRefund {
        async fn create_refund(
            &self,
            _request: RefundRequest,
        ) -> Result<RefundResponse, GatewayError> {
            let body = serde_json::json!({
                "reference_id": self.order_id.to_string(),
                "tracking_id": "TRK-9",
                "status": "delivered",
            });
            self.webhook.handle(body.to_string().as_bytes()).await.unwrap();
            Ok(RefundResponse {
                id: "rf-2".into(),
                status: "SUCCEEDED".into(),
            })
        }
    }

    struct Harness {
        store: Arc<InMemoryFulfillmentStore>,
        gateway: Arc<FakePaymentGateway>,
        worker: JobWorker,
        order: Order,
        payment: Payment,
    }

    fn harness(gateway: FakePaymentGateway, payment_status: PaymentStatus) -> Harness {
        let store = InMemoryFulfillmentStore::arc();
        let now = Utc::now();
        let order = Order::new(OrderId::new(), 50_000, vec![], now);
        let mut payment = Payment::new(PaymentId::new(), order.id, "ext-1", 50_000, now);
        payment.gateway_invoice_id = Some("inv-1".into());
        if payment_status != PaymentStatus::Pending {
            payment.transition(PaymentStatus::Paid, now);
        }
        if payment_status == PaymentStatus::Refunded {
            payment.mark_refunded(now).unwrap();
        }
        store.insert_order(order.clone()).unwrap();
        store.insert_payment(payment.clone()).unwrap();

        let gateway = Arc::new(gateway);
        let handler = Arc::new(RefundJobHandler::new(store.clone(), gateway.clone()));
        let worker = JobWorker::new(
            "refund-worker",
            store.clone(),
            store.clone(),
            handler,
            Arc::new(InMemoryNotificationSink::new()),
        );
        Harness {
            store,
            gateway,
            worker,
            order,
            payment,
        }
    }

    #[tokio::test]
    async fn refunds_payment_and_order() {
        let h = harness(FakePaymentGateway::default(), PaymentStatus::Paid);
        let id = h
            .store
            .enqueue(Job::refund(h.order.id, 50_000, "customer request", Utc::now()))
            .await
            .unwrap();

        let report = h.worker.tick(Utc::now()).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let payment = h.store.payment(h.payment.id).unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        let order = h.store.get_order(h.order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );

        let requests = h.gateway.requests.lock().unwrap();
        assert_eq!(
            requests[0].idempotency_key,
            format!("refund-{}", h.order.id)
        );
        assert_eq!(requests[0].invoice_id, "inv-1");
    }

    #[tokio::test]
    async fn callback_during_refund_call_is_kept() {
        let base = harness(FakePaymentGateway::default(), PaymentStatus::Paid);
        let store = base.store.clone();
        let gateway = Arc::new(ShippingCallbackDuringRefund {
            order_id: base.order.id,
            webhook: ShippingWebhookReconciler::new(
                store.clone(),
                Arc::new(InMemoryNotificationSink::new()),
            ),
        });
        let worker = JobWorker::new(
            "refund-worker",
            store.clone(),
            store.clone(),
            Arc::new(RefundJobHandler::new(store.clone(), gateway)),
            Arc::new(InMemoryNotificationSink::new()),
        );
        store
            .enqueue(Job::refund(base.order.id, 50_000, "returned", Utc::now()))
            .await
            .unwrap();

        let report = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let order = store.get_order(base.order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert_eq!(order.tracking_id.as_deref(), Some("TRK-9"));
        assert_eq!(order.shipping_status.as_deref(), Some("delivered"));
        assert_eq!(
            store.payment(base.payment.id).unwrap().unwrap().status,
            PaymentStatus::Refunded
        );
    }

    #[tokio::test]
    async fn already_refunded_payment_short_circuits() {
        let h = harness(FakePaymentGateway::default(), PaymentStatus::Refunded);
        let id = h
            .store
            .enqueue(Job::refund(h.order.id, 50_000, "dup", Utc::now()))
            .await
            .unwrap();

        let report = h.worker.tick(Utc::now()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.gateway.calls(), 0);
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn no_paid_payment_is_terminal() {
        let h = harness(FakePaymentGateway::default(), PaymentStatus::Pending);
        let id = h
            .store
            .enqueue(Job::refund(h.order.id, 50_000, "r", Utc::now()))
            .await
            .unwrap();

        h.worker.tick(Utc::now()).await.unwrap();
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("no paid payment"));
        assert_eq!(h.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_amounts_are_terminal() {
        for amount in [0, -5, 50_001] {
            let h = harness(FakePaymentGateway::default(), PaymentStatus::Paid);
            let id = h
                .store
                .enqueue(Job::refund(h.order.id, amount, "r", Utc::now()))
                .await
                .unwrap();

            h.worker.tick(Utc::now()).await.unwrap();
            let job = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed, "amount {amount}");
            assert_eq!(h.gateway.calls(), 0);
        }
    }

    #[tokio::test]
    async fn gateway_client_error_is_terminal_and_leaves_payment_paid() {
        let h = harness(
            FakePaymentGateway {
                fail_with: Some(404),
                ..Default::default()
            },
            PaymentStatus::Paid,
        );
        let id = h
            .store
            .enqueue(Job::refund(h.order.id, 100, "r", Utc::now()))
            .await
            .unwrap();

        h.worker.tick(Utc::now()).await.unwrap();
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(
            h.store.payment(h.payment.id).unwrap().unwrap().status,
            PaymentStatus::Paid
        );
    }

    #[tokio::test]
    async fn rate_limited_refund_is_retried() {
        let h = harness(
            FakePaymentGateway {
                fail_with: Some(429),
                ..Default::default()
            },
            PaymentStatus::Paid,
        );
        let id = h
            .store
            .enqueue(Job::refund(h.order.id, 100, "r", Utc::now()))
            .await
            .unwrap();

        let report = h.worker.tick(Utc::now()).await.unwrap();
        assert_eq!(report.retried, 1);
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
    }
}
