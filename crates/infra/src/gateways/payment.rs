use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{GatewayError, build_client, check_status, join_url};

/// Refund call against a captured invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundRequest {
    pub invoice_id: String,
    /// Amount in smallest currency unit.
    pub amount: i64,
    pub external_refund_id: String,
    pub reason: String,
    /// Sent as a header, never in the body.
    #[serde(skip)]
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefundResponse {
    pub id: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_refund(&self, request: RefundRequest) -> Result<RefundResponse, GatewayError>;
}

/// reqwest client for the payment provider.
///
/// Authenticates with HTTP basic auth (secret key as user, empty password).
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            secret_key: secret_key.into(),
        })
    }
}

impl std::fmt::Debug for HttpPaymentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPaymentGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct RefundBody<'a> {
    invoice_id: &'a str,
    amount: i64,
    reason: &'a str,
    external_refund_id: &'a str,
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_refund(&self, request: RefundRequest) -> Result<RefundResponse, GatewayError> {
        debug!(
            invoice_id = %request.invoice_id,
            amount = request.amount,
            idempotency_key = %request.idempotency_key,
            "creating refund"
        );

        let body = RefundBody {
            invoice_id: &request.invoice_id,
            amount: request.amount,
            reason: &request.reason,
            external_refund_id: &request.external_refund_id,
        };

        let response = self
            .client
            .post(join_url(&self.base_url, "refunds"))
            .basic_auth(&self.secret_key, Some(""))
            .header("Idempotency-key", &request.idempotency_key)
            .json(&body)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json::<RefundResponse>().await?)
    }
}
