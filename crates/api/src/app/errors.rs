use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use fulfillment_infra::store::StoreError;
use fulfillment_infra::webhooks::WebhookError;

pub fn webhook_error_to_response(err: WebhookError) -> axum::response::Response {
    let code = err.code();
    match err {
        WebhookError::Unauthorized => json_error(StatusCode::UNAUTHORIZED, code, err.to_string()),
        WebhookError::InvalidPayload(_) | WebhookError::UnknownStatus(_) => {
            json_error(StatusCode::BAD_REQUEST, code, err.to_string())
        }
        WebhookError::NotFound(_) => json_error(StatusCode::NOT_FOUND, code, err.to_string()),
        WebhookError::Store(e) => store_error_to_response(e),
    }
}

/// Store details are logged, not returned.
pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    error!(error = %err, "store failure while serving request");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal error",
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
