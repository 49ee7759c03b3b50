use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fulfillment_core::{DomainError, DomainResult, OrderId};

use crate::shipping::{ShipmentProgress, ShippingDestination};

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(OrderStatus::Pending),
            "CONFIRMED" => Some(OrderStatus::Confirmed),
            "SHIPPED" => Some(OrderStatus::Shipped),
            "DELIVERED" => Some(OrderStatus::Delivered),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "REFUNDED" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order line as the shipping provider needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    pub description: Option<String>,
    pub sku: Option<String>,
    pub quantity: u32,
    /// Price in smallest currency unit.
    pub unit_price: i64,
    pub weight_grams: u32,
}

impl OrderItem {
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && self.quantity > 0 && self.unit_price >= 0
    }
}

/// Shipment facts carried by a provider callback. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipmentUpdate {
    pub shipping_order_id: Option<String>,
    pub tracking_id: Option<String>,
    pub provider_status: Option<String>,
}

/// Order as seen by the fulfillment core.
///
/// Only `status` and the shipping fields are mutated here; everything else is
/// owned by the order-creation flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub status: OrderStatus,
    /// Total in smallest currency unit.
    pub total_amount: i64,
    pub items: Vec<OrderItem>,
    pub destination: Option<ShippingDestination>,
    pub shipping_courier_code: Option<String>,
    pub shipping_courier_service: Option<String>,
    pub shipping_order_id: Option<String>,
    pub tracking_id: Option<String>,
    /// Raw status string last reported by the shipping provider.
    pub shipping_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Row version the store compares on commit; a write based on an older
    /// read is rejected.
    #[serde(default)]
    pub version: i64,
}

impl Order {
    pub fn new(id: OrderId, total_amount: i64, items: Vec<OrderItem>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: OrderStatus::Pending,
            total_amount,
            items,
            destination: None,
            shipping_courier_code: None,
            shipping_courier_service: None,
            shipping_order_id: None,
            tracking_id: None,
            shipping_status: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn has_shipment(&self) -> bool {
        self.shipping_order_id.is_some()
    }

    pub fn valid_items(&self) -> impl Iterator<Item = &OrderItem> {
        self.items.iter().filter(|i| i.is_valid())
    }

    /// Courier code and service, when both were selected at checkout.
    pub fn courier_selection(&self) -> Option<(&str, &str)> {
        let code = self.shipping_courier_code.as_deref().map(str::trim)?;
        let service = self.shipping_courier_service.as_deref().map(str::trim)?;
        if code.is_empty() || service.is_empty() {
            return None;
        }
        Some((code, service))
    }

    /// Record a freshly created shipment. `shipping_order_id` is write-once.
    pub fn record_shipment(
        &mut self,
        shipping_order_id: impl Into<String>,
        tracking_id: Option<String>,
        provider_status: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if let Some(existing) = &self.shipping_order_id {
            return Err(DomainError::conflict(format!(
                "order {} already has shipment {existing}",
                self.id
            )));
        }

        self.shipping_order_id = Some(shipping_order_id.into());
        if tracking_id.is_some() {
            self.tracking_id = tracking_id;
        }
        // A status already reported by a callback is newer than the creation response.
        if self.shipping_status.is_none() {
            self.shipping_status = provider_status;
        }
        if self.status == OrderStatus::Pending {
            self.status = OrderStatus::Confirmed;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_refunded(&mut self, now: DateTime<Utc>) {
        self.status = OrderStatus::Refunded;
        self.updated_at = now;
    }

    /// Advance `status` according to shipment progress. Returns whether it changed.
    ///
    /// | progress        | result    | precondition               |
    /// |-----------------|-----------|----------------------------|
    /// | Delivered       | DELIVERED | status != DELIVERED        |
    /// | InTransit       | SHIPPED   | status in {PENDING, CONFIRMED} |
    /// | AwaitingPickup  | CONFIRMED | status == PENDING          |
    pub fn apply_shipment_progress(&mut self, progress: ShipmentProgress) -> bool {
        let next = match progress {
            ShipmentProgress::Delivered if self.status != OrderStatus::Delivered => {
                OrderStatus::Delivered
            }
            ShipmentProgress::InTransit
                if matches!(self.status, OrderStatus::Pending | OrderStatus::Confirmed) =>
            {
                OrderStatus::Shipped
            }
            ShipmentProgress::AwaitingPickup if self.status == OrderStatus::Pending => {
                OrderStatus::Confirmed
            }
            _ => return false,
        };
        self.status = next;
        true
    }

    /// Fold a provider callback into the order. Returns whether anything changed;
    /// when it returns `false` the order is untouched and nothing needs saving.
    pub fn reconcile_shipment(&mut self, update: &ShipmentUpdate, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if let Some(tracking) = non_blank(update.tracking_id.as_deref()) {
            if self.tracking_id.as_deref() != Some(tracking) {
                self.tracking_id = Some(tracking.to_string());
                changed = true;
            }
        }

        // Write-once: a different id on an order that already has one is ignored.
        if let Some(shipment) = non_blank(update.shipping_order_id.as_deref()) {
            if self.shipping_order_id.is_none() {
                self.shipping_order_id = Some(shipment.to_string());
                changed = true;
            }
        }

        if let Some(raw) = non_blank(update.provider_status.as_deref()) {
            if self.shipping_status.as_deref() != Some(raw) {
                self.shipping_status = Some(raw.to_string());
                changed = true;
            }
            if let Some(progress) = ShipmentProgress::classify(raw) {
                changed |= self.apply_shipment_progress(progress);
            }
        }

        if changed {
            self.updated_at = now;
        }
        changed
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn order() -> Order {
        Order::new(
            OrderId::new(),
            150_000,
            vec![OrderItem {
                name: "Coffee beans".into(),
                description: None,
                sku: Some("CB-1".into()),
                quantity: 2,
                unit_price: 75_000,
                weight_grams: 500,
            }],
            Utc::now(),
        )
    }

    fn status_update(status: &str) -> ShipmentUpdate {
        ShipmentUpdate {
            provider_status: Some(status.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn record_shipment_confirms_pending_order() {
        let mut o = order();
        o.record_shipment("SHP-1", Some("TRK-1".into()), Some("confirmed".into()), Utc::now())
            .unwrap();
        assert_eq!(o.status, OrderStatus::Confirmed);
        assert_eq!(o.shipping_order_id.as_deref(), Some("SHP-1"));
        assert_eq!(o.tracking_id.as_deref(), Some("TRK-1"));
    }

    #[test]
    fn record_shipment_is_write_once() {
        let mut o = order();
        o.record_shipment("SHP-1", None, None, Utc::now()).unwrap();
        let err = o.record_shipment("SHP-2", None, None, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(o.shipping_order_id.as_deref(), Some("SHP-1"));
    }

    #[test]
    fn record_shipment_keeps_status_reported_by_callback() {
        let mut o = order();
        o.status = OrderStatus::Shipped;
        o.shipping_status = Some("picked_up".into());
        o.record_shipment("SHP-1", None, Some("confirmed".into()), Utc::now())
            .unwrap();
        assert_eq!(o.status, OrderStatus::Shipped);
        assert_eq!(o.shipping_status.as_deref(), Some("picked_up"));
    }

    #[test]
    fn record_shipment_keeps_later_statuses() {
        let mut o = order();
        o.status = OrderStatus::Cancelled;
        o.record_shipment("SHP-1", None, None, Utc::now()).unwrap();
        assert_eq!(o.status, OrderStatus::Cancelled);
    }

    #[test]
    fn in_transit_ships_a_confirmed_order() {
        let mut o = order();
        o.status = OrderStatus::Confirmed;
        assert!(o.reconcile_shipment(&status_update("in_transit"), Utc::now()));
        assert_eq!(o.status, OrderStatus::Shipped);
        assert_eq!(o.shipping_status.as_deref(), Some("in_transit"));
    }

    #[test]
    fn delivered_order_does_not_regress_on_waiting_pickup() {
        let mut o = order();
        o.status = OrderStatus::Delivered;
        o.reconcile_shipment(&status_update("waiting_pickup"), Utc::now());
        assert_eq!(o.status, OrderStatus::Delivered);
        assert_eq!(o.shipping_status.as_deref(), Some("waiting_pickup"));
    }

    #[test]
    fn shipped_order_is_not_moved_back_to_confirmed() {
        let mut o = order();
        o.status = OrderStatus::Shipped;
        assert!(!o.apply_shipment_progress(ShipmentProgress::AwaitingPickup));
        assert_eq!(o.status, OrderStatus::Shipped);
    }

    #[test]
    fn identical_callback_is_a_no_op() {
        let mut o = order();
        let update = ShipmentUpdate {
            shipping_order_id: Some("SHP-1".into()),
            tracking_id: Some("TRK-1".into()),
            provider_status: Some("booked".into()),
        };
        assert!(o.reconcile_shipment(&update, Utc::now()));
        let snapshot = o.clone();
        assert!(!o.reconcile_shipment(&update, Utc::now()));
        assert_eq!(o, snapshot);
    }

    #[test]
    fn tracking_id_is_replaced_but_shipment_id_is_not() {
        let mut o = order();
        o.record_shipment("SHP-1", Some("TRK-1".into()), None, Utc::now()).unwrap();
        let update = ShipmentUpdate {
            shipping_order_id: Some("SHP-9".into()),
            tracking_id: Some("TRK-2".into()),
            provider_status: None,
        };
        assert!(o.reconcile_shipment(&update, Utc::now()));
        assert_eq!(o.tracking_id.as_deref(), Some("TRK-2"));
        assert_eq!(o.shipping_order_id.as_deref(), Some("SHP-1"));
    }

    #[test]
    fn courier_selection_requires_both_fields() {
        let mut o = order();
        assert!(o.courier_selection().is_none());
        o.shipping_courier_code = Some("jne".into());
        o.shipping_courier_service = Some("  ".into());
        assert!(o.courier_selection().is_none());
        o.shipping_courier_service = Some("reg".into());
        assert_eq!(o.courier_selection(), Some(("jne", "reg")));
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(OrderStatus::parse("shipped"), Some(OrderStatus::Shipped));
        assert_eq!(OrderStatus::parse("nope"), None);
        assert_eq!(
            serde_json::to_string(&OrderStatus::Delivered).unwrap(),
            "\"DELIVERED\""
        );
    }

    const PROVIDER_STATUSES: &[&str] = &[
        "confirmed",
        "allocated",
        "booked",
        "waiting_pickup",
        "ready_for_pickup",
        "picked_up",
        "courier_picked_up",
        "on the way",
        "in_transit",
        "on_delivery",
        "delivered",
        "completed",
        "returned",
    ];

    proptest! {
        #[test]
        fn delivered_is_absorbing(sequence in proptest::collection::vec(0..PROVIDER_STATUSES.len(), 1..20)) {
            let mut o = order();
            let mut delivered = false;
            for idx in sequence {
                o.reconcile_shipment(&status_update(PROVIDER_STATUSES[idx]), Utc::now());
                if delivered {
                    prop_assert_eq!(o.status, OrderStatus::Delivered);
                }
                delivered |= o.status == OrderStatus::Delivered;
            }
        }

        #[test]
        fn shipped_never_returns_to_confirmed(sequence in proptest::collection::vec(0..PROVIDER_STATUSES.len(), 1..20)) {
            let mut o = order();
            let mut shipped = false;
            for idx in sequence {
                o.reconcile_shipment(&status_update(PROVIDER_STATUSES[idx]), Utc::now());
                if shipped {
                    prop_assert!(matches!(o.status, OrderStatus::Shipped | OrderStatus::Delivered));
                }
                shipped |= o.status == OrderStatus::Shipped;
            }
        }
    }
}
