//! Shipment creation job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use fulfillment_orders::{Order, StoreSettings};

use super::error::JobError;
use super::types::{Job, JobType};
use super::worker::JobHandler;
use crate::gateways::{ShipmentContact, ShipmentItem, ShipmentOrderRequest, ShippingGateway};
use crate::store::{ChangeSet, OrderStore};

pub struct ShippingJobHandler {
    orders: Arc<dyn OrderStore>,
    gateway: Arc<dyn ShippingGateway>,
}

impl ShippingJobHandler {
    pub fn new(orders: Arc<dyn OrderStore>, gateway: Arc<dyn ShippingGateway>) -> Self {
        Self { orders, gateway }
    }

    async fn load_order(&self, job: &Job) -> Result<Order, JobError> {
        self.orders
            .get_order(job.order_id)
            .await?
            .ok_or_else(|| JobError::precondition(format!("order {} not found", job.order_id)))
    }
}

#[async_trait]
impl JobHandler for ShippingJobHandler {
    fn job_type(&self) -> JobType {
        JobType::Shipping
    }

    async fn execute(&self, job: &Job) -> Result<ChangeSet, JobError> {
        let order = self.load_order(job).await?;

        if order.has_shipment() {
            debug!(order_id = %order.id, "order already has a shipment");
            return Ok(ChangeSet::new());
        }

        let settings = self.orders.store_settings().await?;
        let request = build_request(&order, settings.as_ref())?;

        let response = self.gateway.create_shipment_order(request).await?;
        info!(
            order_id = %order.id,
            shipping_order_id = %response.id,
            "shipment order created"
        );

        // Callbacks may have landed during the call; apply the shipment to the current row.
        let mut order = self.load_order(job).await?;
        if order.has_shipment() {
            debug!(order_id = %order.id, "shipment recorded while the gateway call ran");
            return Ok(ChangeSet::new());
        }
        let tracking_id = response.tracking_id();
        order.record_shipment(response.id, tracking_id, response.status, Utc::now())?;
        Ok(ChangeSet::new().with_order(order))
    }
}

/// Assemble the provider request, failing on any missing or invalid input.
pub fn build_request(
    order: &Order,
    settings: Option<&StoreSettings>,
) -> Result<ShipmentOrderRequest, JobError> {
    let (courier_company, courier_type) = order.courier_selection().ok_or_else(|| {
        JobError::precondition(format!("order {} has no courier selection", order.id))
    })?;

    let destination = order
        .destination
        .as_ref()
        .filter(|d| d.is_complete())
        .ok_or_else(|| {
            JobError::precondition(format!("order {} has an incomplete destination", order.id))
        })?;
    let destination_coordinate = destination
        .coordinate
        .filter(|c| c.is_valid())
        .ok_or_else(|| {
            JobError::precondition(format!(
                "order {} has no valid destination coordinates",
                order.id
            ))
        })?;

    let settings = settings
        .filter(|s| s.is_complete())
        .ok_or_else(|| JobError::precondition("store origin settings are incomplete"))?;
    // is_complete() guarantees a valid coordinate.
    let origin_coordinate = settings
        .coordinate
        .ok_or_else(|| JobError::precondition("store origin coordinates are missing"))?;

    let items: Vec<ShipmentItem> = order
        .valid_items()
        .map(|item| ShipmentItem {
            name: item.name.clone(),
            description: item.description.clone(),
            sku: item.sku.clone(),
            value: item.unit_price,
            quantity: item.quantity,
            weight_grams: item.weight_grams,
        })
        .collect();
    if items.is_empty() {
        return Err(JobError::precondition(format!(
            "order {} has no valid items",
            order.id
        )));
    }

    Ok(ShipmentOrderRequest {
        reference_id: order.id.to_string(),
        origin: ShipmentContact {
            name: settings.contact_name.clone(),
            phone: settings.contact_phone.clone(),
            address: settings.address.clone(),
            postal_code: settings.postal_code.clone(),
            coordinate: origin_coordinate,
        },
        destination: ShipmentContact {
            name: destination.contact_name.clone(),
            phone: destination.contact_phone.clone(),
            address: destination.address.clone(),
            postal_code: destination.postal_code.clone(),
            coordinate: destination_coordinate,
        },
        items,
        courier_company: courier_company.to_string(),
        courier_type: courier_type.to_string(),
    })
}
