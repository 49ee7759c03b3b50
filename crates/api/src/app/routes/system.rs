use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::errors::store_error_to_response;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.jobs.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => store_error_to_response(err),
    }
}
