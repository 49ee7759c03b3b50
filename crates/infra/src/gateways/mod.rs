//! Outbound clients for the payment and shipping providers.
//!
//! Each provider sits behind an async trait so workers can be exercised
//! against fakes; the reqwest implementations only translate wire formats
//! and map HTTP failures into [`GatewayError`].

pub mod error;
pub mod payment;
pub mod shipping;

pub use error::GatewayError;
pub use payment::{HttpPaymentGateway, PaymentGateway, RefundRequest, RefundResponse};
pub use shipping::{
    HttpShippingGateway, ShipmentContact, ShipmentItem, ShipmentOrderRequest,
    ShipmentOrderResponse, ShippingGateway,
};

use std::time::Duration;

use reqwest::{Client, Response};

pub(crate) fn build_client(timeout: Duration) -> Result<Client, GatewayError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

/// Turn a non-2xx response into `GatewayError::Http`, keeping the body for diagnostics.
pub(crate) async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(GatewayError::Http {
        status: status.as_u16(),
        body,
    })
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
