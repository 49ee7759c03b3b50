use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use fulfillment_core::OrderId;
use fulfillment_infra::jobs::JobId;
use fulfillment_infra::store::{OrderStore, StoreError};

use crate::app::errors::{json_error, store_error_to_response};
use crate::app::services::AppServices;

#[derive(Debug, Deserialize)]
pub struct RefundJobRequest {
    pub amount: i64,
    #[serde(default)]
    pub reason: String,
}

/// Order lifecycle hook: the order's payment was captured.
pub async fn enqueue_shipping(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match known_order(&services, &id).await {
        Ok(order_id) => order_id,
        Err(response) => return response,
    };
    accepted(services.queue.enqueue_shipping_job(order_id).await)
}

/// Order lifecycle hook: the order was cancelled or a refund was requested.
pub async fn enqueue_refund(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<RefundJobRequest>,
) -> axum::response::Response {
    if body.amount <= 0 {
        return json_error(
            StatusCode::BAD_REQUEST,
            "invalid_amount",
            "refund amount must be positive",
        );
    }
    let order_id = match known_order(&services, &id).await {
        Ok(order_id) => order_id,
        Err(response) => return response,
    };
    accepted(
        services
            .queue
            .enqueue_refund_job(order_id, body.amount, body.reason)
            .await,
    )
}

async fn known_order(
    services: &AppServices,
    id: &str,
) -> Result<OrderId, axum::response::Response> {
    let order_id: OrderId = id
        .parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid order id"))?;
    match services.orders.get_order(order_id).await {
        Ok(Some(_)) => Ok(order_id),
        Ok(None) => Err(json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("order {order_id} not found"),
        )),
        Err(err) => Err(store_error_to_response(err)),
    }
}

/// Enqueue is idempotent, so a repeat returns the active job's id.
fn accepted(result: Result<JobId, StoreError>) -> axum::response::Response {
    match result {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))).into_response(),
        Err(err) => store_error_to_response(err),
    }
}
