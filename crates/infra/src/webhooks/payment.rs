use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use fulfillment_orders::{PaymentStatus, PaymentTransition};

use super::WebhookError;
use crate::notifications::{self, Notification, NotificationSink};
use crate::store::{ChangeSet, OrderStore};

/// Validated payment callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCallback {
    pub external_id: String,
    /// Only `PAID` and `EXPIRED` are accepted from the provider.
    pub status: PaymentStatus,
}

#[derive(Deserialize)]
struct RawPaymentCallback {
    external_id: Option<String>,
    status: Option<String>,
}

impl PaymentCallback {
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        let raw: RawPaymentCallback = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        let external_id = raw
            .external_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| WebhookError::InvalidPayload("external_id is required".into()))?;
        let status = raw
            .status
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| WebhookError::InvalidPayload("status is required".into()))?;

        let status = match PaymentStatus::parse(&status) {
            Some(s @ (PaymentStatus::Paid | PaymentStatus::Expired)) => s,
            _ => return Err(WebhookError::UnknownStatus(status)),
        };

        Ok(Self {
            external_id,
            status,
        })
    }
}

/// Result of a callback that passed validation. Every variant is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentWebhookOutcome {
    Applied {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// Duplicate delivery; nothing written.
    Unchanged,
    /// Would move the payment backwards or sideways; nothing written.
    Stale {
        current: PaymentStatus,
        requested: PaymentStatus,
    },
}

pub struct PaymentWebhookReconciler {
    orders: Arc<dyn OrderStore>,
    notifier: Arc<dyn NotificationSink>,
    callback_token: String,
}

impl PaymentWebhookReconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        notifier: Arc<dyn NotificationSink>,
        callback_token: impl Into<String>,
    ) -> Self {
        Self {
            orders,
            notifier,
            callback_token: callback_token.into(),
        }
    }

    /// Authenticate, validate and apply a payment callback.
    ///
    /// The token is checked before the body is parsed; nothing is read from
    /// the store until the payload is fully validated.
    #[instrument(skip_all, err)]
    pub async fn handle(
        &self,
        callback_token: Option<&str>,
        body: &[u8],
    ) -> Result<PaymentWebhookOutcome, WebhookError> {
        let authorized = callback_token
            .is_some_and(|t| constant_time_eq(t.as_bytes(), self.callback_token.as_bytes()));
        if !authorized {
            return Err(WebhookError::Unauthorized);
        }

        let callback = PaymentCallback::parse(body)?;

        let mut payment = self
            .orders
            .find_payment_by_external_id(&callback.external_id)
            .await?
            .ok_or_else(|| WebhookError::NotFound(format!("payment {}", callback.external_id)))?;

        match payment.transition(callback.status, Utc::now()) {
            PaymentTransition::Applied { from, to } => {
                let order_id = payment.order_id;
                self.orders
                    .commit(ChangeSet::new().with_payment(payment))
                    .await?;
                info!(
                    external_id = %callback.external_id,
                    order_id = %order_id,
                    from = %from,
                    to = %to,
                    "payment status updated"
                );
                notifications::emit(
                    self.notifier.as_ref(),
                    Notification::PaymentUpdated {
                        external_id: callback.external_id,
                        order_id,
                        from,
                        to,
                    },
                )
                .await;
                Ok(PaymentWebhookOutcome::Applied { from, to })
            }
            PaymentTransition::Unchanged => {
                info!(
                    external_id = %callback.external_id,
                    status = %callback.status,
                    "duplicate payment callback"
                );
                Ok(PaymentWebhookOutcome::Unchanged)
            }
            PaymentTransition::Rejected { current, requested } => {
                warn!(
                    external_id = %callback.external_id,
                    current = %current,
                    requested = %requested,
                    "ignoring stale payment callback"
                );
                notifications::emit(
                    self.notifier.as_ref(),
                    Notification::StalePaymentCallback {
                        external_id: callback.external_id,
                        order_id: payment.order_id,
                        current,
                        requested,
                    },
                )
                .await;
                Ok(PaymentWebhookOutcome::Stale { current, requested })
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
