//! Orders & payments domain module.
//!
//! This crate contains the state rules for orders, payments and shipments,
//! implemented purely as deterministic domain logic (no IO, no HTTP, no storage).
//! Workers and webhook reconcilers in `fulfillment-infra` call into these types
//! so every status transition is decided in one place.

pub mod order;
pub mod payment;
pub mod shipping;

pub use order::{Order, OrderItem, OrderStatus, ShipmentUpdate};
pub use payment::{Payment, PaymentStatus, PaymentTransition};
pub use shipping::{Coordinate, ShipmentProgress, ShippingDestination, StoreSettings};
