//! Best-effort side-channel alerts on job and webhook outcomes.
//!
//! Callers log and drop [`NotifyError`]; a failing sink never changes job,
//! order or payment state. A sink that hangs is abandoned after
//! [`NOTIFY_TIMEOUT`] so it cannot stall a worker tick or a webhook response.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use fulfillment_core::OrderId;
use fulfillment_orders::{OrderStatus, PaymentStatus};

use crate::jobs::{JobId, JobType};

/// Upper bound for one delivery attempt.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    JobSucceeded {
        job_id: JobId,
        job_type: JobType,
        order_id: OrderId,
        /// Nothing to do: the effect was already in place.
        skipped: bool,
    },
    JobRetryScheduled {
        job_id: JobId,
        job_type: JobType,
        order_id: OrderId,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        error: String,
    },
    JobFailed {
        job_id: JobId,
        job_type: JobType,
        order_id: OrderId,
        attempts: u32,
        error: String,
    },
    PaymentUpdated {
        external_id: String,
        order_id: OrderId,
        from: PaymentStatus,
        to: PaymentStatus,
    },
    StalePaymentCallback {
        external_id: String,
        order_id: OrderId,
        current: PaymentStatus,
        requested: PaymentStatus,
    },
    ShipmentUpdated {
        order_id: OrderId,
        status: OrderStatus,
        shipping_status: Option<String>,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Emits notifications as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let payload =
            serde_json::to_string(&notification).map_err(|e| NotifyError(e.to_string()))?;
        info!(target: "fulfillment::notifications", notification = %payload, "notification");
        Ok(())
    }
}

/// Records notifications for assertions in tests.
#[derive(Debug, Default, Clone)]
pub struct InMemoryNotificationSink {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError("sink lock poisoned".into()))?
            .push(notification);
        Ok(())
    }
}

/// Forward to `sink`, logging instead of propagating failures.
pub(crate) async fn emit(sink: &dyn NotificationSink, notification: Notification) {
    emit_within(sink, notification, NOTIFY_TIMEOUT).await;
}

async fn emit_within(sink: &dyn NotificationSink, notification: Notification, limit: Duration) {
    match tokio::time::timeout(limit, sink.notify(notification)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "dropping notification"),
        Err(_) => tracing::warn!(
            timeout_ms = limit.as_millis() as u64,
            "notification sink timed out, dropping notification"
        ),
    }
}
