use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use fulfillment_core::OrderId;
use fulfillment_orders::{Order, OrderStatus, ShipmentUpdate};

use super::WebhookError;
use crate::notifications::{self, Notification, NotificationSink};
use crate::store::{ChangeSet, OrderStore};

/// Shipping provider callback. Courier/driver enrichment fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ShippingCallback {
    #[serde(default)]
    pub id: Option<String>,
    /// Provider shipment id.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Our order id, echoed back by the provider.
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub tracking_id: Option<String>,
    #[serde(default)]
    pub courier_tracking_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ShippingCallback {
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
    }

    pub fn tracking(&self) -> Option<&str> {
        non_blank(self.tracking_id.as_deref()).or(non_blank(self.courier_tracking_id.as_deref()))
    }

    pub fn shipment_id(&self) -> Option<&str> {
        non_blank(self.order_id.as_deref()).or(non_blank(self.id.as_deref()))
    }

    fn update(&self) -> ShipmentUpdate {
        ShipmentUpdate {
            shipping_order_id: self.shipment_id().map(str::to_string),
            tracking_id: self.tracking().map(str::to_string),
            provider_status: non_blank(self.status.as_deref()).map(str::to_string),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShippingWebhookOutcome {
    Updated { order_id: OrderId, status: OrderStatus },
    Unchanged { order_id: OrderId },
    /// No order matched; acknowledged so the provider stops retrying.
    Ignored,
}

pub struct ShippingWebhookReconciler {
    orders: Arc<dyn OrderStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl ShippingWebhookReconciler {
    pub fn new(orders: Arc<dyn OrderStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { orders, notifier }
    }

    #[instrument(skip_all, err)]
    pub async fn handle(&self, body: &[u8]) -> Result<ShippingWebhookOutcome, WebhookError> {
        let callback = ShippingCallback::parse(body)?;

        let Some(mut order) = self.resolve(&callback).await? else {
            warn!(
                reference_id = ?callback.reference_id,
                tracking_id = ?callback.tracking(),
                shipment_id = ?callback.shipment_id(),
                "shipping callback matched no order"
            );
            return Ok(ShippingWebhookOutcome::Ignored);
        };

        if !order.reconcile_shipment(&callback.update(), Utc::now()) {
            debug!(order_id = %order.id, "shipping callback changed nothing");
            return Ok(ShippingWebhookOutcome::Unchanged { order_id: order.id });
        }

        let (order_id, status, shipping_status) =
            (order.id, order.status, order.shipping_status.clone());
        self.orders.commit(ChangeSet::new().with_order(order)).await?;
        info!(
            order_id = %order_id,
            status = %status,
            shipping_status = ?shipping_status,
            "shipment updated"
        );
        notifications::emit(
            self.notifier.as_ref(),
            Notification::ShipmentUpdated {
                order_id,
                status,
                shipping_status,
            },
        )
        .await;
        Ok(ShippingWebhookOutcome::Updated { order_id, status })
    }

    /// Reference id (our order id), then tracking id, then provider shipment id.
    async fn resolve(&self, callback: &ShippingCallback) -> Result<Option<Order>, WebhookError> {
        if let Some(order_id) = non_blank(callback.reference_id.as_deref())
            .and_then(|r| OrderId::from_str(r).ok())
        {
            if let Some(order) = self.orders.get_order(order_id).await? {
                return Ok(Some(order));
            }
        }
        if let Some(tracking) = callback.tracking() {
            if let Some(order) = self.orders.find_order_by_tracking_id(tracking).await? {
                return Ok(Some(order));
            }
        }
        if let Some(shipment) = callback.shipment_id() {
            if let Some(order) = self.orders.find_order_by_shipping_order_id(shipment).await? {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }
}
