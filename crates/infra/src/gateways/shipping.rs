use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fulfillment_orders::Coordinate;

use super::{GatewayError, build_client, check_status, join_url};

/// One end of a shipment (pickup origin or delivery destination).
#[derive(Debug, Clone, PartialEq)]
pub struct ShipmentContact {
    pub name: String,
    pub phone: String,
    pub address: String,
    pub postal_code: Option<String>,
    pub coordinate: Coordinate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShipmentItem {
    pub name: String,
    pub description: Option<String>,
    pub sku: Option<String>,
    /// Unit value in smallest currency unit.
    pub value: i64,
    pub quantity: u32,
    #[serde(rename = "weight")]
    pub weight_grams: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShipmentOrderRequest {
    /// Our order id; the provider echoes it back in callbacks.
    pub reference_id: String,
    pub origin: ShipmentContact,
    pub destination: ShipmentContact,
    pub items: Vec<ShipmentItem>,
    pub courier_company: String,
    pub courier_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ShipmentCourier {
    #[serde(default)]
    pub tracking_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShipmentOrderResponse {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub courier: Option<ShipmentCourier>,
}

impl ShipmentOrderResponse {
    pub fn tracking_id(&self) -> Option<String> {
        self.courier.as_ref().and_then(|c| c.tracking_id.clone())
    }
}

#[async_trait]
pub trait ShippingGateway: Send + Sync {
    async fn create_shipment_order(
        &self,
        request: ShipmentOrderRequest,
    ) -> Result<ShipmentOrderResponse, GatewayError>;
}

/// reqwest client for the shipping aggregator.
pub struct HttpShippingGateway {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpShippingGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

impl std::fmt::Debug for HttpShippingGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpShippingGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// Flat wire shape expected by the provider.
#[derive(Serialize)]
struct ShipmentOrderBody<'a> {
    reference_id: &'a str,
    origin_contact_name: &'a str,
    origin_contact_phone: &'a str,
    origin_address: &'a str,
    origin_postal_code: Option<&'a str>,
    origin_coordinate: Coordinate,
    destination_contact_name: &'a str,
    destination_contact_phone: &'a str,
    destination_address: &'a str,
    destination_postal_code: Option<&'a str>,
    destination_coordinate: Coordinate,
    courier_company: &'a str,
    courier_type: &'a str,
    delivery_type: &'static str,
    items: &'a [ShipmentItem],
}

impl<'a> From<&'a ShipmentOrderRequest> for ShipmentOrderBody<'a> {
    fn from(r: &'a ShipmentOrderRequest) -> Self {
        Self {
            reference_id: &r.reference_id,
            origin_contact_name: &r.origin.name,
            origin_contact_phone: &r.origin.phone,
            origin_address: &r.origin.address,
            origin_postal_code: r.origin.postal_code.as_deref(),
            origin_coordinate: r.origin.coordinate,
            destination_contact_name: &r.destination.name,
            destination_contact_phone: &r.destination.phone,
            destination_address: &r.destination.address,
            destination_postal_code: r.destination.postal_code.as_deref(),
            destination_coordinate: r.destination.coordinate,
            courier_company: &r.courier_company,
            courier_type: &r.courier_type,
            delivery_type: "now",
            items: &r.items,
        }
    }
}

#[async_trait]
impl ShippingGateway for HttpShippingGateway {
    async fn create_shipment_order(
        &self,
        request: ShipmentOrderRequest,
    ) -> Result<ShipmentOrderResponse, GatewayError> {
        debug!(
            reference_id = %request.reference_id,
            courier = %request.courier_company,
            items = request.items.len(),
            "creating shipment order"
        );

        let response = self
            .client
            .post(join_url(&self.base_url, "v1/orders"))
            .header("Authorization", &self.api_key)
            .json(&ShipmentOrderBody::from(&request))
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json::<ShipmentOrderResponse>().await?)
    }
}
