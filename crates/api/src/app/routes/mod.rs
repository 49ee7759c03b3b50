use axum::{Router, routing::post};

pub mod jobs;
pub mod system;
pub mod webhooks;

/// Provider callback endpoints, mounted under `/webhooks`.
pub fn router() -> Router {
    Router::new()
        .route("/payment", post(webhooks::payment))
        .route("/shipping", post(webhooks::shipping))
}
