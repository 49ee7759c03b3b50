//! Inbound provider callbacks.
//!
//! Reconcilers validate the whole callback before reading state and write
//! through a single [`crate::store::OrderStore::commit`], so a rejected
//! callback never leaves a partial mutation behind.

pub mod payment;
pub mod shipping;

pub use payment::{PaymentCallback, PaymentWebhookOutcome, PaymentWebhookReconciler};
pub use shipping::{ShippingCallback, ShippingWebhookOutcome, ShippingWebhookReconciler};

use crate::store::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WebhookError {
    #[error("missing or invalid callback token")]
    Unauthorized,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown status: {0}")]
    UnknownStatus(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WebhookError {
    /// Stable machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::Unauthorized => "unauthorized",
            WebhookError::InvalidPayload(_) => "invalid_payload",
            WebhookError::UnknownStatus(_) => "unknown_status",
            WebhookError::NotFound(_) => "not_found",
            WebhookError::Store(_) => "internal_error",
        }
    }
}
