use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

use fulfillment_infra::webhooks::{PaymentWebhookOutcome, ShippingWebhookOutcome};

use crate::app::errors::webhook_error_to_response;
use crate::app::services::AppServices;

pub const CALLBACK_TOKEN_HEADER: &str = "x-callback-token";

/// Payment provider callback. The raw body is handed to the reconciler so
/// the token is checked before any parsing.
pub async fn payment(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let token = headers
        .get(CALLBACK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    match services.payment_webhooks.handle(token, &body).await {
        Ok(outcome) => {
            let body = match outcome {
                PaymentWebhookOutcome::Applied { to, .. } => {
                    json!({ "result": "applied", "payment_status": to })
                }
                PaymentWebhookOutcome::Unchanged => json!({ "result": "unchanged" }),
                PaymentWebhookOutcome::Stale { current, .. } => {
                    json!({ "result": "stale", "payment_status": current })
                }
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => webhook_error_to_response(err),
    }
}

/// Shipping provider callback. Unmatched callbacks are acknowledged.
pub async fn shipping(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    match services.shipping_webhooks.handle(&body).await {
        Ok(ShippingWebhookOutcome::Updated { order_id, status }) => (
            StatusCode::OK,
            Json(json!({ "result": "updated", "order_id": order_id, "status": status })),
        )
            .into_response(),
        Ok(ShippingWebhookOutcome::Unchanged { order_id }) => (
            StatusCode::OK,
            Json(json!({ "result": "unchanged", "order_id": order_id })),
        )
            .into_response(),
        Ok(ShippingWebhookOutcome::Ignored) => {
            (StatusCode::OK, Json(json!({ "result": "ignored" }))).into_response()
        }
        Err(err) => webhook_error_to_response(err),
    }
}
