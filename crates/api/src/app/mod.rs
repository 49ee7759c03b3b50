//! HTTP application wiring (axum router + service wiring).
//!
//! - `services.rs`: stores, gateways, reconcilers and the job runtime
//! - `routes/`: HTTP handlers, one file per area
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;

pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/internal/jobs/stats", get(routes::system::job_stats))
        .route(
            "/internal/orders/:id/shipping-job",
            post(routes::jobs::enqueue_shipping),
        )
        .route(
            "/internal/orders/:id/refund-job",
            post(routes::jobs::enqueue_refund),
        )
        .nest("/webhooks", routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
