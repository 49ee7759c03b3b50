use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use fulfillment_infra::gateways::{
    HttpPaymentGateway, HttpShippingGateway, PaymentGateway, ShippingGateway,
};
use fulfillment_infra::jobs::JobQueue;
use fulfillment_infra::notifications::{NotificationSink, TracingNotificationSink};
use fulfillment_infra::store::{
    InMemoryFulfillmentStore, JobStore, OrderStore, PostgresFulfillmentStore,
};
use fulfillment_infra::webhooks::{PaymentWebhookReconciler, ShippingWebhookReconciler};
use fulfillment_infra::{FulfillmentConfig, FulfillmentRuntime, JobsConfig};

/// Everything the handlers and the background runtime share.
pub struct AppServices {
    pub jobs: Arc<dyn JobStore>,
    pub orders: Arc<dyn OrderStore>,
    pub queue: JobQueue,
    pub payment_webhooks: PaymentWebhookReconciler,
    pub shipping_webhooks: ShippingWebhookReconciler,
    shipping_gateway: Arc<dyn ShippingGateway>,
    payment_gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn NotificationSink>,
}

impl AppServices {
    pub fn from_parts(
        jobs: Arc<dyn JobStore>,
        orders: Arc<dyn OrderStore>,
        shipping_gateway: Arc<dyn ShippingGateway>,
        payment_gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSink>,
        callback_token: impl Into<String>,
    ) -> Self {
        Self {
            queue: JobQueue::new(jobs.clone()),
            payment_webhooks: PaymentWebhookReconciler::new(
                orders.clone(),
                notifier.clone(),
                callback_token,
            ),
            shipping_webhooks: ShippingWebhookReconciler::new(orders.clone(), notifier.clone()),
            jobs,
            orders,
            shipping_gateway,
            payment_gateway,
            notifier,
        }
    }

    pub fn runtime(&self, config: &JobsConfig) -> FulfillmentRuntime {
        FulfillmentRuntime::new(
            self.jobs.clone(),
            self.orders.clone(),
            self.shipping_gateway.clone(),
            self.payment_gateway.clone(),
            self.notifier.clone(),
            config,
        )
    }
}

/// Wire stores and gateways from configuration.
///
/// `DATABASE_URL` selects Postgres (schema is bootstrapped on start);
/// otherwise everything lives in memory for local runs.
pub async fn build_services(config: &FulfillmentConfig) -> anyhow::Result<AppServices> {
    let (jobs, orders): (Arc<dyn JobStore>, Arc<dyn OrderStore>) = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to postgres")?;
            let store = Arc::new(PostgresFulfillmentStore::new(pool));
            store
                .ensure_schema()
                .await
                .context("failed to bootstrap schema")?;
            info!("using postgres stores");
            (store.clone(), store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores");
            let store = InMemoryFulfillmentStore::arc();
            (store.clone(), store)
        }
    };

    let timeout = config.jobs.gateway_timeout;
    let shipping_gateway = Arc::new(
        HttpShippingGateway::new(
            config.shipping_gateway.base_url.clone(),
            config.shipping_gateway.api_key.clone(),
            timeout,
        )
        .context("failed to build shipping gateway client")?,
    );
    let payment_gateway = Arc::new(
        HttpPaymentGateway::new(
            config.payment_gateway.base_url.clone(),
            config.payment_gateway.api_key.clone(),
            timeout,
        )
        .context("failed to build payment gateway client")?,
    );

    Ok(AppServices::from_parts(
        jobs,
        orders,
        shipping_gateway,
        payment_gateway,
        Arc::new(TracingNotificationSink),
        config.payment_callback_token.clone(),
    ))
}
