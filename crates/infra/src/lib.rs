//! Infrastructure for order fulfillment: persistence, provider gateways,
//! the background job engine and inbound webhook reconciliation.

pub mod config;
pub mod gateways;
pub mod jobs;
pub mod notifications;
pub mod runtime;
pub mod store;
pub mod webhooks;

pub use config::{ConfigError, FulfillmentConfig, GatewayConfig, JobsConfig};
pub use runtime::{FulfillmentRuntime, RuntimeHandle};
