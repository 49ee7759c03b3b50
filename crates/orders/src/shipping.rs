use serde::{Deserialize, Serialize};

/// Geographic coordinate used by the shipping provider for pickup/drop-off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Finite, in range, and not the (0, 0) placeholder some clients send.
    pub fn is_valid(&self) -> bool {
        let in_range = self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude);
        in_range && !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

/// Where an order is delivered to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingDestination {
    pub contact_name: String,
    pub contact_phone: String,
    pub address: String,
    pub postal_code: Option<String>,
    pub coordinate: Option<Coordinate>,
}

impl ShippingDestination {
    pub fn is_complete(&self) -> bool {
        !self.contact_name.trim().is_empty()
            && !self.contact_phone.trim().is_empty()
            && !self.address.trim().is_empty()
    }
}

/// Origin settings for the store (pickup point for every shipment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub contact_name: String,
    pub contact_phone: String,
    pub address: String,
    pub postal_code: Option<String>,
    pub coordinate: Option<Coordinate>,
}

impl StoreSettings {
    pub fn is_complete(&self) -> bool {
        !self.contact_name.trim().is_empty()
            && !self.contact_phone.trim().is_empty()
            && !self.address.trim().is_empty()
            && self.coordinate.is_some_and(|c| c.is_valid())
    }
}

/// Coarse shipment progress derived from a free-text provider status.
///
/// Variants are ordered: a later variant never moves an order backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentProgress {
    AwaitingPickup,
    InTransit,
    Delivered,
}

const DELIVERED_MARKERS: &[&str] = &["delivered", "completed", "finished"];
const IN_TRANSIT_MARKERS: &[&str] = &[
    "on_delivery",
    "on the way",
    "courier_picked_up",
    "picked_up",
    "in_transit",
];
const AWAITING_PICKUP_MARKERS: &[&str] = &["waiting_pickup", "ready_for_pickup", "booked"];

impl ShipmentProgress {
    /// Case-insensitive substring match; the first matching row wins
    /// (delivered, then in-transit, then awaiting pickup).
    pub fn classify(provider_status: &str) -> Option<Self> {
        let status = provider_status.to_lowercase();
        let matches = |markers: &[&str]| markers.iter().any(|m| status.contains(m));

        if matches(DELIVERED_MARKERS) {
            Some(Self::Delivered)
        } else if matches(IN_TRANSIT_MARKERS) {
            Some(Self::InTransit)
        } else if matches(AWAITING_PICKUP_MARKERS) {
            Some(Self::AwaitingPickup)
        } else {
            None
        }
    }
}
